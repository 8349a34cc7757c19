use anyhow::Context;
use treesyncd::client::ClientDriver;
use treesyncd::config::{ClientConfig, ServerConfig};
use treesyncd::logging;
use treesyncd::server::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Client,
    Once,
    Server,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Client;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "client" => mode = CliMode::Client,
            "once" => mode = CliMode::Once,
            "server" => mode = CliMode::Server,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init();
    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: treesyncd [client|once|server]");
            println!("  client   Sync the configured directories every poll interval (default)");
            println!("  once     Run a single sync cycle and exit");
            println!("  server   Serve sync directories to clients");
            Ok(())
        }
        CliMode::Server => {
            let config = ServerConfig::from_env().context("invalid server configuration")?;
            Server::bind(config).await?.run().await
        }
        CliMode::Once => {
            let config = ClientConfig::from_env().context("invalid client configuration")?;
            let mut driver = ClientDriver::new(config);
            for report in driver.run_once().await? {
                println!(
                    "{}: {} pushed, {} pulled, {}",
                    report.directory,
                    report.pushed.applied,
                    report.pulled.map(|pulled| pulled.applied).unwrap_or(0),
                    if report.converged { "in sync" } else { "pending" }
                );
            }
            Ok(())
        }
        CliMode::Client => {
            let config = ClientConfig::from_env().context("invalid client configuration")?;
            ClientDriver::new(config).run().await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("treesyncd")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_client() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Client);
    }

    #[test]
    fn parse_cli_mode_supports_server_and_once() {
        assert_eq!(parse_cli_mode(args(&["server"])).unwrap(), CliMode::Server);
        assert_eq!(parse_cli_mode(args(&["once"])).unwrap(), CliMode::Once);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_arguments() {
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
    }
}
