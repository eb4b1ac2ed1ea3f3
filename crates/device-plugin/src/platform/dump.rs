use std::path::Path;
use std::path::PathBuf;

/// Writes a diagnostic report to `<dir>/gpushare_<timestamp>.txt`.
pub async fn write_dump(dir: &Path, report: &str) -> std::io::Result<PathBuf> {
    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let path = dir.join(format!("gpushare_{timestamp}.txt"));
    tokio::fs::write(&path, report).await?;
    Ok(path)
}
