mod commands;
mod serve;

use anyhow::Result;

use crate::core::config::{self, Config};
use crate::core::terminal::{self, print_error};

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(api_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

pub(crate) fn parse_ingest_text(args: &[String], start: usize) -> Option<String> {
    let mut text = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--text" | "-t" => {
                if i + 1 < args.len() {
                    text = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    text.filter(|t| !t.trim().is_empty())
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = config::data_dir();
    let config = Config::load(&data_dir)?;

    if args.len() < 2 {
        terminal::print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "serve" => {
            let (api_host, api_port) = parse_api_server_flags(
                &args,
                2,
                config.server.host.clone(),
                config.server.port,
            );
            serve::run_server(config, data_dir, api_host, api_port).await
        }
        "ingest" => match parse_ingest_text(&args, 2) {
            Some(text) => commands::run_ingest(&config, &data_dir, &text).await,
            None => {
                print_error("Error: --text is required for ingest.");
                terminal::print_help();
                Ok(())
            }
        },
        "schedules" => commands::run_list_schedules(&config, &data_dir).await,
        "help" | "--help" | "-h" => {
            terminal::print_help();
            Ok(())
        }
        cmd => {
            print_error(&format!("Unknown command: {}", cmd));
            terminal::print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_api_server_flags, parse_ingest_text};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_api_server_flags_reads_host_and_port() {
        let args = args(&[
            "agentdeck",
            "serve",
            "--api-host",
            "0.0.0.0",
            "--api-port",
            "19000",
        ]);
        let (host, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 17890);
        assert_eq!(host, "0.0.0.0");
        assert_eq!(port, 19000);
    }

    #[test]
    fn parse_api_server_flags_keeps_defaults_on_bad_input() {
        let args = args(&["agentdeck", "serve", "--api-port", "not-a-port", "--api-host"]);
        let (host, port) = parse_api_server_flags(&args, 2, "127.0.0.1".to_string(), 17890);
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 17890);
    }

    #[test]
    fn parse_ingest_text_requires_a_value() {
        let full = args(&["agentdeck", "ingest", "--text", "hello world"]);
        assert_eq!(parse_ingest_text(&full, 2).as_deref(), Some("hello world"));

        let short = args(&["agentdeck", "ingest", "-t", "hi"]);
        assert_eq!(parse_ingest_text(&short, 2).as_deref(), Some("hi"));

        let blank = args(&["agentdeck", "ingest", "--text", "  "]);
        assert_eq!(parse_ingest_text(&blank, 2), None);

        let missing = args(&["agentdeck", "ingest", "--text"]);
        assert_eq!(parse_ingest_text(&missing, 2), None);
    }
}
