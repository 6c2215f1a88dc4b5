//! External tool invocation.
//!
//! Every side-effecting host tool (mmdebstrap, sfdisk, mkfs, dd, xz, qemu)
//! goes through [`ToolRunner`]. Failures become
//! [`BuildError::StageExecution`] carrying the exit code and both captured
//! streams; nothing downstream inspects tool text to make decisions.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::BuildError;

/// A program plus its arguments and optional stdin payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn input(&self) -> Option<&str> {
        self.stdin.as_deref()
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Exit status and captured streams of a finished tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs host tools. Blocks until the tool exits; no timeout is applied.
pub trait ToolRunner: Send + Sync {
    fn run(&self, invocation: &ToolInvocation) -> io::Result<ToolOutput>;
}

/// Runs tools on the host with `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run(&self, invocation: &ToolInvocation) -> io::Result<ToolOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn()?;
        if let (Some(input), Some(mut stdin)) = (invocation.stdin.as_deref(), child.stdin.take()) {
            stdin.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a tool and turn anything but exit code 0 into a stage error.
pub fn run_checked(
    runner: &dyn ToolRunner,
    stage: &str,
    invocation: &ToolInvocation,
) -> Result<ToolOutput, BuildError> {
    debug!(stage, "running {}", invocation);
    let output = runner
        .run(invocation)
        .map_err(|err| BuildError::StageExecution {
            stage: stage.to_string(),
            tool: invocation.program.clone(),
            exit_code: None,
            stdout: String::new(),
            stderr: format!("could not start `{}`: {}", invocation.program, err),
        })?;
    if !output.success() {
        return Err(BuildError::StageExecution {
            stage: stage.to_string(),
            tool: invocation.program.clone(),
            exit_code: output.exit_code,
            stdout: output.stdout.trim().to_string(),
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use crate::artifact::filesystem::copy_dir_recursive;

    /// Records every invocation and fakes the filesystem effects of the tools
    /// the stages depend on.
    #[derive(Default)]
    pub(crate) struct FakeTools {
        calls: Mutex<Vec<ToolInvocation>>,
        failures: Mutex<Vec<(String, ToolOutput)>>,
        serial_output: Mutex<String>,
    }

    impl FakeTools {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Make the next call to `program` exit with `code`.
        pub(crate) fn fail_next(&self, program: &str, code: i32, stderr: &str) {
            self.failures.lock().unwrap().push((
                program.to_string(),
                ToolOutput {
                    exit_code: Some(code),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                },
            ));
        }

        pub(crate) fn set_serial_output(&self, text: &str) {
            *self.serial_output.lock().unwrap() = text.to_string();
        }

        pub(crate) fn calls(&self) -> Vec<ToolInvocation> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn programs(&self) -> Vec<String> {
            self.calls().iter().map(|c| c.program.clone()).collect()
        }

        pub(crate) fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn simulate(&self, invocation: &ToolInvocation) -> io::Result<ToolOutput> {
            let args = &invocation.args;
            match invocation.program.as_str() {
                "mmdebstrap" if args.len() >= 3 => {
                    let target = PathBuf::from(&args[args.len() - 2]);
                    for dir in ["bin", "etc/apt", "etc/systemd/system", "lib", "usr/bin", "var/lib"] {
                        fs::create_dir_all(target.join(dir))?;
                    }
                    fs::write(target.join("etc/debian_version"), "13.0\n")?;
                    fs::write(target.join("usr/bin/env"), vec![0u8; 4096])?;
                }
                "cp" if args.len() == 3 => {
                    copy_dir_recursive(Path::new(&args[1]), Path::new(&args[2]))
                        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
                }
                "chroot" if args.iter().any(|a| a == "install") => {
                    let rootfs = PathBuf::from(&args[0]);
                    if args.iter().any(|a| a.starts_with("linux-image-")) {
                        fs::create_dir_all(rootfs.join("boot"))?;
                        for (link, file) in [("vmlinuz", "vmlinuz-fry"), ("initrd.img", "initrd.img-fry")] {
                            fs::write(rootfs.join("boot").join(file), b"image")?;
                            let link = rootfs.join(link);
                            if link.symlink_metadata().is_ok() {
                                fs::remove_file(&link)?;
                            }
                            std::os::unix::fs::symlink(format!("boot/{}", file), link)?;
                        }
                    }
                }
                "mkimage" => {
                    if let Some(out) = args.last() {
                        fs::write(out, b"script")?;
                    }
                }
                "xz" | "gzip" => {
                    let input = PathBuf::from(args.last().cloned().unwrap_or_default());
                    let ext = if invocation.program == "xz" { "xz" } else { "gz" };
                    let mut name = input.clone().into_os_string();
                    name.push(format!(".{}", ext));
                    fs::write(PathBuf::from(name), b"compressed")?;
                }
                "timeout" if args.iter().any(|a| a.starts_with("qemu-system-")) => {
                    return Ok(ToolOutput {
                        exit_code: Some(0),
                        stdout: self.serial_output.lock().unwrap().clone(),
                        stderr: String::new(),
                    });
                }
                _ => {}
            }
            Ok(ToolOutput::ok())
        }
    }

    impl ToolRunner for FakeTools {
        fn run(&self, invocation: &ToolInvocation) -> io::Result<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            let mut failures = self.failures.lock().unwrap();
            if let Some(pos) = failures
                .iter()
                .position(|(program, _)| program == &invocation.program)
            {
                let (_, output) = failures.remove(pos);
                return Ok(output);
            }
            drop(failures);
            self.simulate(invocation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeTools;
    use super::*;

    #[test]
    fn test_invocation_display() {
        let inv = ToolInvocation::new("dd")
            .arg("if=/a")
            .args(["bs=1M", "conv=notrunc"]);
        assert_eq!(inv.to_string(), "dd if=/a bs=1M conv=notrunc");
    }

    #[test]
    fn test_run_checked_keeps_exit_code_and_streams() {
        let tools = FakeTools::new();
        tools.fail_next("sfdisk", 1, "sfdisk: cannot open\n");
        let err = run_checked(&tools, "image-assemble", &ToolInvocation::new("sfdisk")).unwrap_err();
        assert_eq!(
            err,
            BuildError::StageExecution {
                stage: "image-assemble".to_string(),
                tool: "sfdisk".to_string(),
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "sfdisk: cannot open".to_string(),
            }
        );
        assert!(run_checked(&tools, "image-assemble", &ToolInvocation::new("sfdisk")).is_ok());
    }

    #[test]
    fn test_system_runner_captures_output() {
        let output = SystemToolRunner
            .run(&ToolInvocation::new("sh").args(["-c", "cat; echo err >&2; exit 3"]).stdin("hello"))
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_missing_program_is_stage_error() {
        let err = run_checked(
            &SystemToolRunner,
            "bootstrap",
            &ToolInvocation::new("definitely_not_a_real_command_12345"),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::StageExecution { exit_code: None, .. }));
    }
}
