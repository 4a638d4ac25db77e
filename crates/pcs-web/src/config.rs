use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_PCS_PATH: &str = "/usr/bin/baidupcs";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub pcs_path: PathBuf,
    pub download_dir: PathBuf,
    pub static_dir: PathBuf,
    pub index_file: PathBuf,
    pub debug: bool,
    pub write_timeout: Duration,
    pub log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "pcs-web", about = "Web control panel for the baidupcs client")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    pcs_path: String,
    #[arg(long, default_value = "")]
    download_dir: String,
    #[arg(long, default_value = "")]
    static_dir: String,
    #[arg(long, default_value = "")]
    index: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

pub fn load_config() -> Config {
    from_args(Args::parse())
}

pub fn from_args(args: Args) -> Config {
    Config {
        addr: resolve(&args.addr, "PCS_WEB_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
        pcs_path: resolve(&args.pcs_path, "PCS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PCS_PATH)),
        download_dir: resolve(&args.download_dir, "PCS_WEB_DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_download_dir),
        static_dir: PathBuf::from(
            resolve(&args.static_dir, "PCS_WEB_STATIC_DIR").unwrap_or_else(|| "public".into()),
        ),
        index_file: PathBuf::from(
            resolve(&args.index, "PCS_WEB_INDEX").unwrap_or_else(|| "index.html".into()),
        ),
        debug: args.debug || env_true("PCS_WEB_DEBUG"),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        log_dir: resolve(&args.log_dir, "PCS_WEB_LOG_DIR").unwrap_or_default(),
    }
}

/// Flag wins over environment; blank values count as unset.
fn resolve(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn default_download_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join("Downloads").join("baidupcs-web")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "pcs-web",
            "--addr",
            "0.0.0.0:8080",
            "--pcs-path",
            "/opt/pcs",
            "--download-dir",
            "/data/dl",
            "--write-timeout",
            "5",
        ]);
        let config = from_args(args);
        assert_eq!(config.addr, "0.0.0.0:8080");
        assert_eq!(config.pcs_path, PathBuf::from("/opt/pcs"));
        assert_eq!(config.download_dir, PathBuf::from("/data/dl"));
        assert_eq!(config.write_timeout, Duration::from_secs(5));
    }

    #[test]
    fn blank_flag_is_unset() {
        assert_eq!(resolve("  ", "PCS_WEB_TEST_KEY_THAT_IS_NEVER_SET"), None);
        assert_eq!(
            resolve("x", "PCS_WEB_TEST_KEY_THAT_IS_NEVER_SET").as_deref(),
            Some("x")
        );
    }
}
