use anyhow::{bail, Context, Result};
use fry_builder::batch::build_all;
use fry_builder::plan::Overrides;
use fry_builder::preflight::{check_host, required_tools};
use fry_builder::stages::compress::export_rootfs_archive;
use fry_builder::stages::{StageContext, StageExecutor, StageId, StageOptions};
use fry_builder::tools::SystemToolRunner;
use fry_builder::{BuildPlan, Project};

use crate::{Cli, Commands};

pub(crate) fn dispatch(cli: Cli) -> Result<()> {
    let root = crate::workflows::locate_project_root(cli.root.as_deref())?;
    let project = Project::new(root);

    match cli.command {
        Commands::Profiles => {
            crate::workflows::report::print_profiles(&project.profiles()?);
            Ok(())
        }
        Commands::BuildAll => {
            let profiles = project.profiles()?;
            if profiles.is_empty() {
                bail!("no profiles under '{}'", project.profiles_dir().display());
            }
            let template = overrides("", &cli.image_size, &cli.output_dir);
            let outcomes = build_all(
                &project,
                &profiles,
                &template,
                &SystemToolRunner,
                StageOptions::default(),
            );
            crate::workflows::report::print_batch(&outcomes);
            let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
            if failed > 0 {
                bail!("{} of {} profiles failed", failed, outcomes.len());
            }
            Ok(())
        }
        command => {
            let Some(profile) = cli.profile.as_deref() else {
                bail!("no profile selected; pass --profile or set PROFILE");
            };
            let plan = project.load_plan(&overrides(profile, &cli.image_size, &cli.output_dir))?;
            run_profile_command(&project, &plan, command)
                .with_context(|| format!("profile '{}'", profile))
        }
    }
}

fn overrides(
    profile: &str,
    image_size: &Option<String>,
    output_dir: &Option<std::path::PathBuf>,
) -> Overrides {
    let mut overrides = Overrides::new(profile);
    overrides.image_size = image_size.clone();
    overrides.output_dir = output_dir.clone();
    overrides
}

fn run_profile_command(project: &Project, plan: &BuildPlan, command: Commands) -> Result<()> {
    match command {
        Commands::Plan => {
            println!("{}", plan.to_json().context("serializing plan")?);
            return Ok(());
        }
        Commands::Preflight => {
            crate::workflows::report::print_tools(&required_tools(plan));
            return check_host(plan);
        }
        _ => {}
    }

    let options = StageOptions {
        smoke_test: matches!(command, Commands::Validate { smoke_test: true }),
    };
    let workspace = project.workspace(plan);
    let profile_dir = project.profile_dir(plan.profile());
    let ctx = StageContext::prepare(plan, &workspace, &SystemToolRunner, Some(&profile_dir), options)?;
    let executor = StageExecutor::new(ctx);

    let summary = match command {
        Commands::Configure => executor.run_through(StageId::Configure)?,
        Commands::Rootfs { archive } => {
            let summary = executor.run_through(StageId::ServiceInject)?;
            if archive {
                let path = export_rootfs_archive(plan, &workspace)?;
                println!("rootfs archive: {}", path.display());
            }
            summary
        }
        Commands::Build { no_preflight } => {
            if !no_preflight {
                check_host(plan)?;
            }
            executor.run_all()?
        }
        Commands::Compress => executor.run_only(StageId::Compress)?,
        Commands::Validate { .. } => executor.run_only(StageId::Validate)?,
        Commands::Clean => return executor.clean(),
        Commands::Reset => return executor.reset(),
        Commands::Status => {
            crate::workflows::report::print_status(
                plan,
                &executor.status()?,
                &executor.run_state()?,
            );
            return Ok(());
        }
        Commands::Profiles | Commands::BuildAll | Commands::Plan | Commands::Preflight => {
            bail!("command does not run build stages")
        }
    };
    crate::workflows::report::print_summary(plan, &workspace, &summary);
    Ok(())
}
