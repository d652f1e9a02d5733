use std::path::PathBuf;
use subtune::app::AppStartupOptions;
use subtune::catalog::ServerConfig;
use subtune::model::BackendKind;

#[derive(Debug, Default)]
struct CliArgs {
    server: Option<String>,
    user: Option<String>,
    password: Option<String>,
    backend: Option<BackendKind>,
    mpv_path: Option<PathBuf>,
    resume: bool,
    song_ids: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args(std::env::args().skip(1).collect())?;
    let server = ServerConfig {
        base_url: required(args.server, "SUBTUNE_SERVER", "--server")?,
        username: required(args.user, "SUBTUNE_USER", "--user")?,
        password: required(args.password, "SUBTUNE_PASSWORD", "--password")?,
    };

    subtune::app::run_with_startup(AppStartupOptions {
        server,
        backend: args.backend,
        mpv_path: args.mpv_path,
        resume: args.resume,
        song_ids: args.song_ids,
    })
}

fn required(flag: Option<String>, env_key: &str, flag_name: &str) -> anyhow::Result<String> {
    if let Some(value) = flag {
        return Ok(value);
    }
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => anyhow::bail!("{flag_name} or {env_key} is required"),
    }
}

fn parse_args(args: Vec<String>) -> anyhow::Result<CliArgs> {
    let mut out = CliArgs::default();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            flag @ ("--server" | "--user" | "--password" | "--backend" | "--mpv-path") => {
                index += 1;
                let Some(value) = args.get(index).map(|value| value.trim()) else {
                    anyhow::bail!("{flag} requires a value");
                };
                if value.is_empty() {
                    anyhow::bail!("{flag} cannot be empty");
                }
                match flag {
                    "--server" => out.server = Some(value.to_string()),
                    "--user" => out.user = Some(value.to_string()),
                    "--password" => out.password = Some(value.to_string()),
                    "--backend" => {
                        let Some(kind) = BackendKind::parse(value) else {
                            anyhow::bail!("unknown backend {value} (expected local or mpv)");
                        };
                        out.backend = Some(kind);
                    }
                    _ => out.mpv_path = Some(PathBuf::from(value)),
                }
            }
            "--resume" => out.resume = true,
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            other if other.starts_with('-') => anyhow::bail!("unknown argument {other}"),
            id => out.song_ids.push(id.to_string()),
        }
        index += 1;
    }
    Ok(out)
}

fn print_help() {
    println!("subtune [options] [SONG_ID...]");
    println!("  --server URL        Subsonic server (or SUBTUNE_SERVER)");
    println!("  --user NAME         account name (or SUBTUNE_USER)");
    println!("  --password PASS     account password (or SUBTUNE_PASSWORD)");
    println!("  --backend local|mpv playback engine");
    println!("  --mpv-path PATH     mpv binary to launch");
    println!("  --resume            restore the server play queue");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_flags_and_song_ids() {
        let parsed = parse_args(args(&[
            "--server",
            "https://music.example.com",
            "--backend",
            "mpv",
            "--resume",
            "12",
            "13",
        ]))
        .expect("parse");
        assert_eq!(parsed.server.as_deref(), Some("https://music.example.com"));
        assert_eq!(parsed.backend, Some(BackendKind::Mpv));
        assert!(parsed.resume);
        assert_eq!(parsed.song_ids, vec!["12", "13"]);
    }

    #[test]
    fn rejects_missing_values_and_unknown_flags() {
        assert!(parse_args(args(&["--user"])).is_err());
        assert!(parse_args(args(&["--backend", "vlc"])).is_err());
        assert!(parse_args(args(&["--loud"])).is_err());
    }
}
