//! Emulator smoke test for finished disk images.
//!
//! Boots the raw image headless in `qemu-system-<arch>` and watches the serial
//! console for a login prompt or a known failure. The run is bounded by
//! `timeout(1)`, so the emulator is killed if the guest never halts.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::plan::Architecture;
use crate::tools::{ToolInvocation, ToolRunner};

/// Any of these on the serial console means the guest reached userspace.
pub const SUCCESS_PATTERNS: &[&str] = &["login:", "Reached target multi-user.target"];

/// Any of these means the boot failed.
pub const FAILURE_PATTERNS: &[&str] = &[
    "Kernel panic",
    "not syncing",
    "VFS: Cannot open root device",
    "No init found",
    "emergency shell",
    "Emergency mode",
    "No bootable device",
    "Boot Failed",
    "error: no such device",
];

/// Exit code `timeout(1)` uses when it had to stop the emulator.
const TIMEOUT_EXIT: i32 = 124;

/// How a smoke boot ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeOutcome {
    Passed { matched: String },
    Failed { reason: String, tail: Vec<String> },
    /// No emulator path for this architecture.
    Unsupported,
}

/// Builder for a headless boot of a raw disk image.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    arch: Architecture,
    disk: PathBuf,
    memory_mb: u32,
    smp: u32,
    firmware: Option<PathBuf>,
    timeout_secs: u64,
}

impl QemuBuilder {
    pub fn new(arch: Architecture, disk: &Path) -> Self {
        Self {
            arch,
            disk: disk.to_path_buf(),
            memory_mb: 1024,
            smp: 2,
            firmware: None,
            timeout_secs: 300,
        }
    }

    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn firmware(mut self, path: PathBuf) -> Self {
        self.firmware = Some(path);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// `None` when the architecture has no supported boot path in the emulator.
    pub fn build(&self) -> Option<ToolInvocation> {
        let mut qemu = match self.arch {
            Architecture::Amd64 => {
                let mut inv = ToolInvocation::new("timeout");
                inv = inv.args(timeout_args(self.timeout_secs)).arg("qemu-system-x86_64");
                if Path::new("/dev/kvm").exists() && !self.arch.is_foreign() {
                    inv = inv.args(["-enable-kvm", "-cpu", "host"]);
                }
                inv
            }
            Architecture::Arm64 => {
                let firmware = self.firmware.as_ref()?;
                ToolInvocation::new("timeout")
                    .args(timeout_args(self.timeout_secs))
                    .arg("qemu-system-aarch64")
                    .args(["-machine", "virt", "-cpu", "cortex-a72", "-bios"])
                    .arg_path(firmware)
            }
            Architecture::Armhf | Architecture::Mips | Architecture::Mipsel => return None,
        };
        qemu = qemu
            .arg("-m")
            .arg(self.memory_mb.to_string())
            .arg("-smp")
            .arg(self.smp.to_string())
            .arg("-drive")
            .arg(format!("file={},format=raw,if=virtio,snapshot=on", self.disk.display()))
            .args([
                "-netdev",
                "user,id=net0",
                "-device",
                "virtio-net-pci,netdev=net0",
                "-nographic",
                "-no-reboot",
            ]);
        Some(qemu)
    }
}

fn timeout_args(secs: u64) -> Vec<String> {
    vec!["--kill-after=10".to_string(), format!("{}s", secs)]
}

/// UEFI firmware for the arm64 guest.
pub fn find_firmware(arch: Architecture) -> Option<PathBuf> {
    let candidates: &[&str] = match arch {
        Architecture::Arm64 => &[
            "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
            "/usr/share/AAVMF/AAVMF_CODE.fd",
            "/usr/share/edk2/aarch64/QEMU_EFI.fd",
        ],
        _ => &[],
    };
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Classify serial console output. Failure patterns win over success.
pub fn classify_serial(output: &str) -> Option<SmokeOutcome> {
    let lines: Vec<&str> = output.lines().collect();
    let tail = || -> Vec<String> {
        let start = lines.len().saturating_sub(20);
        lines[start..].iter().map(|l| l.to_string()).collect()
    };
    for line in &lines {
        if let Some(pattern) = FAILURE_PATTERNS.iter().find(|p| line.contains(*p)) {
            return Some(SmokeOutcome::Failed {
                reason: format!("boot failure: {}", pattern),
                tail: tail(),
            });
        }
    }
    for line in &lines {
        if let Some(pattern) = SUCCESS_PATTERNS.iter().find(|p| line.contains(*p)) {
            return Some(SmokeOutcome::Passed {
                matched: pattern.to_string(),
            });
        }
    }
    None
}

/// Boot `disk` and report what the serial console showed.
pub fn smoke_test(tools: &dyn ToolRunner, arch: Architecture, disk: &Path) -> Result<SmokeOutcome> {
    if !disk.exists() {
        bail!("image not found at {}", disk.display());
    }
    let mut builder = QemuBuilder::new(arch, disk);
    if let Some(firmware) = find_firmware(arch) {
        builder = builder.firmware(firmware);
    }
    let Some(invocation) = builder.build() else {
        warn!(architecture = %arch, "no emulator boot path; smoke test skipped");
        return Ok(SmokeOutcome::Unsupported);
    };

    info!(image = %disk.display(), "booting image for smoke test");
    let output = tools.run(&invocation)?;
    if let Some(outcome) = classify_serial(&output.stdout) {
        return Ok(outcome);
    }
    let lines: Vec<&str> = output.stdout.lines().collect();
    let tail = lines[lines.len().saturating_sub(20)..]
        .iter()
        .map(|l| l.to_string())
        .collect();
    let reason = match output.exit_code {
        Some(TIMEOUT_EXIT) => "no login prompt before the timeout".to_string(),
        Some(code) => format!("emulator exited with code {} before a login prompt", code),
        None => "emulator was killed before a login prompt".to_string(),
    };
    Ok(SmokeOutcome::Failed { reason, tail })
}
