//! Per-backend log-config materialization
//!
//! Each backend gets its own copy of a shared log-configuration template
//! with the log file path and level substituted. The resulting file is
//! passed to the backend via `--log-config`; the gateway never reads it
//! back.

use std::io;
use std::path::{Path, PathBuf};

/// Shared template. `{{LOG_FILE}}` and `{{LOG_LEVEL}}` are replaced per
/// backend when the file is materialized.
const TEMPLATE: &str = r#"{
  "version": 1,
  "disable_existing_loggers": false,
  "formatters": {
    "default": {
      "format": "%(asctime)s %(levelname)s %(name)s %(message)s"
    }
  },
  "handlers": {
    "file": {
      "class": "logging.FileHandler",
      "filename": "{{LOG_FILE}}",
      "formatter": "default"
    }
  },
  "root": {
    "level": "{{LOG_LEVEL}}",
    "handlers": ["file"]
  }
}
"#;

/// Render the template for one backend
pub fn render(log_file: &str, log_level: &str) -> String {
    TEMPLATE
        .replace("{{LOG_FILE}}", log_file)
        .replace("{{LOG_LEVEL}}", &log_level.to_uppercase())
}

/// Write the log-config file for a backend into `dir`, creating the
/// directory (and the log file's parent directory) as needed. Returns
/// the path to pass via `--log-config`.
pub fn materialize(
    dir: &Path,
    name: &str,
    log_file: &str,
    log_level: &str,
) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    if let Some(parent) = Path::new(log_file).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let path = dir.join(format!("{}.log-config.json", name));
    std::fs::write(&path, render(log_file, log_level))?;
    Ok(path)
}
