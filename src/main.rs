use anyhow::Result;
use clap::{CommandFactory, Parser};
use layercache::{
    cli::{self, CacheSubcommand, DockerSubcommand},
    commands,
    oci::RepackOptions,
    ui,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        ui::error(&format!("Fatal error: {panic_info}"));
        std::process::exit(1);
    }));

    let args: Vec<String> = std::env::args().collect();
    if args.len() == 1 {
        let mut cmd = cli::Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    }

    let cli = match cli::Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    print!("{e}");
                    std::process::exit(0);
                }
                _ => {
                    ui::error(&e.to_string());
                    std::process::exit(1);
                }
            }
        }
    };

    let default_level = if cli.verbose { "info" } else { "error" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        cli::Commands::Flatten {
            output,
            layers,
            compression,
            apply_opaque,
        } => {
            commands::flatten::execute(
                output,
                layers,
                compression.compression(),
                cli::opaque_policy(apply_opaque),
            )
            .await
        }
        cli::Commands::Pack {
            input,
            outputs,
            compression,
        } => commands::pack::execute(input, outputs, compression.compression(), cli.verbose).await,
        cli::Commands::Repack {
            source,
            destination,
            layers,
            compression,
            apply_opaque,
            work_dir,
        } => {
            let options = RepackOptions {
                layers,
                compression: compression.compression(),
                opaque_whiteouts: cli::opaque_policy(apply_opaque),
                work_dir,
            };
            commands::repack::execute(source, destination, options).await
        }
        cli::Commands::Cache { action } => match action {
            CacheSubcommand::Get { key } => commands::cache::get(key).await,
            CacheSubcommand::Upload { key, file } => commands::cache::upload(key, file).await,
            CacheSubcommand::Download { key, file } => commands::cache::download(key, file).await,
        },
        cli::Commands::Docker { action } => match action {
            DockerSubcommand::Load { key } => commands::docker::load(key).await,
            DockerSubcommand::Save { image, key, layers } => {
                commands::docker::save(image, key, layers).await
            }
            DockerSubcommand::Build {
                file,
                context,
                service,
                always_build,
                key,
            } => commands::docker::build(file, context, service, always_build, key).await,
            DockerSubcommand::Pull { image, always_pull } => {
                commands::docker::pull(image, always_pull).await
            }
        },
    };

    handle_result(result)
}

fn handle_result(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                match io_err.kind() {
                    std::io::ErrorKind::BrokenPipe => {
                        ui::error("Connection interrupted");
                        std::process::exit(141);
                    }
                    _ => {
                        ui::error(&format!("IO Error: {e:#}"));
                        std::process::exit(1);
                    }
                }
            } else {
                let error_msg = format!("{:?}", e);
                if error_msg.contains("Caused by:") {
                    ui::error(&error_msg);
                } else {
                    ui::error(&format!("Error: {e}"));
                }
                std::process::exit(1);
            }
        }
    }
}
