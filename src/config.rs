use crate::error::AppError;
use crate::market::types::{PipelineArgs, DEFAULT_ENDPOINT};
use std::path::{Path, PathBuf};

pub const ENDPOINT_ENV: &str = "TICK_PIPELINE_ENDPOINT";
pub const CONFIG_PATH_ENV: &str = "TICK_PIPELINE_CONFIG";
pub const LOG_JSON_ENV: &str = "TICK_PIPELINE_LOG_JSON";

pub fn resolve_default_endpoint() -> String {
    std::env::var(ENDPOINT_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
}

/// `--config <path>` wins over the environment.
pub fn resolve_config_path<I>(cli_args: I) -> Result<Option<PathBuf>, AppError>
where
    I: IntoIterator<Item = String>,
{
    let mut cli_args = cli_args.into_iter();
    while let Some(arg) = cli_args.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(Some(PathBuf::from(path)));
        }
        if arg == "--config" {
            return match cli_args.next() {
                Some(path) => Ok(Some(PathBuf::from(path))),
                None => Err(AppError::InvalidArgument(
                    "--config requires a path".to_string(),
                )),
            };
        }
    }

    Ok(std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from))
}

pub fn load_pipeline_args(path: &Path) -> Result<PipelineArgs, AppError> {
    let mut raw = std::fs::read(path)?;
    parse_pipeline_args(&mut raw)
}

pub fn parse_pipeline_args(raw: &mut [u8]) -> Result<PipelineArgs, AppError> {
    let args = simd_json::serde::from_slice::<PipelineArgs>(raw)?;
    Ok(args)
}

pub fn log_json_enabled() -> bool {
    matches!(
        std::env::var(LOG_JSON_ENV).ok().as_deref(),
        Some("1") | Some("true")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::Mode;

    fn owned(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn reads_config_flag_in_both_forms() {
        let split = resolve_config_path(owned(&["tick-pipeline", "--config", "a.json"]))
            .expect("flag parses");
        assert_eq!(split, Some(PathBuf::from("a.json")));

        let joined =
            resolve_config_path(owned(&["tick-pipeline", "--config=b.json"])).expect("flag parses");
        assert_eq!(joined, Some(PathBuf::from("b.json")));
    }

    #[test]
    fn config_flag_without_path_is_rejected() {
        assert!(resolve_config_path(owned(&["tick-pipeline", "--config"])).is_err());
    }

    #[test]
    fn parses_camel_case_pipeline_args() {
        let mut raw =
            br#"{"endpoint":"127.0.0.1:9001","initialMode":"simulated","retryDelayMs":1500}"#
                .to_vec();

        let args = parse_pipeline_args(&mut raw).expect("args parse");

        assert_eq!(args.endpoint.as_deref(), Some("127.0.0.1:9001"));
        assert_eq!(args.initial_mode, Some(Mode::Simulated));
        assert_eq!(args.retry_delay_ms, Some(1_500));
        assert_eq!(args.max_buckets, None);
    }

    #[test]
    fn rejects_malformed_config() {
        let mut raw = br#"{"retryDelayMs":"soon"}"#.to_vec();
        assert!(parse_pipeline_args(&mut raw).is_err());
    }
}
