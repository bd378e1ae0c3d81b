use log::debug;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Point-in-time resource usage of a running VM. Fields the host cannot
/// report are left empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStats {
    pub pid: u32,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub rss_kib: Option<u64>,
    pub elapsed: Option<String>,
    /// Bytes the disk image occupies on the host filesystem.
    pub image_allocated_bytes: Option<u64>,
    pub image_apparent_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PsSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub rss_kib: u64,
    pub elapsed: String,
}

pub(crate) async fn collect(pid: u32, image: &Path) -> ProcessStats {
    let sample = sample_ps(pid).await;
    let (allocated, apparent) = image_usage(image);
    ProcessStats {
        pid,
        cpu_percent: sample.as_ref().map(|s| s.cpu_percent),
        memory_percent: sample.as_ref().map(|s| s.memory_percent),
        rss_kib: sample.as_ref().map(|s| s.rss_kib),
        elapsed: sample.map(|s| s.elapsed),
        image_allocated_bytes: allocated,
        image_apparent_bytes: apparent,
    }
}

async fn sample_ps(pid: u32) -> Option<PsSample> {
    let output = Command::new("ps")
        .args(["-o", "pid=,%cpu=,%mem=,rss=,etime=", "-p"])
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            text.lines().find_map(|line| parse_ps_line(pid, line))
        }
        Ok(out) => {
            debug!("ps -p {} exited with {}", pid, out.status);
            None
        }
        Err(e) => {
            debug!("Failed to run ps: {}", e);
            None
        }
    }
}

/// Parse one `pid %cpu %mem rss etime` row. Locales that print a decimal
/// comma are accepted.
pub(crate) fn parse_ps_line(pid: u32, line: &str) -> Option<PsSample> {
    let mut fields = line.split_whitespace();
    if fields.next()?.parse::<u32>().ok()? != pid {
        return None;
    }
    let cpu = fields.next()?.replace(',', ".").parse().ok()?;
    let mem = fields.next()?.replace(',', ".").parse().ok()?;
    let rss = fields.next()?.parse().ok()?;
    let elapsed = fields.next()?.to_string();
    Some(PsSample {
        cpu_percent: cpu,
        memory_percent: mem,
        rss_kib: rss,
        elapsed,
    })
}

#[cfg(unix)]
fn image_usage(image: &Path) -> (Option<u64>, Option<u64>) {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(image) {
        Ok(meta) => (Some(meta.blocks() * 512), Some(meta.len())),
        Err(_) => (None, None),
    }
}

#[cfg(not(unix))]
fn image_usage(image: &Path) -> (Option<u64>, Option<u64>) {
    match std::fs::metadata(image) {
        Ok(meta) => (None, Some(meta.len())),
        Err(_) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_procps_row() {
        let sample = parse_ps_line(4242, "  4242 12.5  3.1 524288    01:02:03").unwrap();
        assert_eq!(sample.cpu_percent, 12.5);
        assert_eq!(sample.memory_percent, 3.1);
        assert_eq!(sample.rss_kib, 524288);
        assert_eq!(sample.elapsed, "01:02:03");
    }

    #[test]
    fn accepts_decimal_commas() {
        let sample = parse_ps_line(7, "7 0,5 1,0 100 00:05").unwrap();
        assert_eq!(sample.cpu_percent, 0.5);
    }

    #[test]
    fn rejects_rows_for_other_pids_or_short_rows() {
        assert!(parse_ps_line(1, "2 0.0 0.0 10 00:01").is_none());
        assert!(parse_ps_line(1, "1 0.0").is_none());
    }

    #[tokio::test]
    async fn missing_image_leaves_disk_fields_empty() {
        let stats = collect(u32::MAX, Path::new("/nonexistent/cloudvm.qcow2")).await;
        assert_eq!(stats.image_allocated_bytes, None);
        assert_eq!(stats.image_apparent_bytes, None);
        assert_eq!(stats.cpu_percent, None);
    }
}
