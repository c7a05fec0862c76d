//! CPU / RAM / VRAM readouts and GPU detection
//!
//! Linux reads /proc, NVIDIA GPUs are queried through nvidia-smi. Anything
//! that cannot be measured is reported as unavailable rather than as an error.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

const VRAM_TOOL: &str = "nvidia-smi";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub backend: GpuBackend,
    pub name: String,
    pub vram_mb: u64,
    /// CUDA compute capability major version, when known
    pub compute_major: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpuBackend {
    Metal,
    Cuda,
    None,
}

impl std::fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuBackend::Metal => write!(f, "Metal"),
            GpuBackend::Cuda => write!(f, "CUDA"),
            GpuBackend::None => write!(f, "None"),
        }
    }
}

impl GpuInfo {
    /// RTX 50-series and newer
    pub fn is_blackwell(&self) -> bool {
        self.compute_major.map(|m| m >= 10).unwrap_or(false)
    }
}

pub fn detect_gpu() -> GpuInfo {
    if let Some(info) = detect_cuda() {
        return info;
    }

    if cfg!(target_os = "macos") {
        if let Some(info) = detect_metal() {
            return info;
        }
    }

    GpuInfo {
        backend: GpuBackend::None,
        name: "No GPU".to_string(),
        vram_mb: 0,
        compute_major: None,
    }
}

fn detect_cuda() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,compute_cap",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let output_str = String::from_utf8_lossy(&output.stdout);
    parse_cuda_line(output_str.lines().next()?)
}

fn parse_cuda_line(line: &str) -> Option<GpuInfo> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 2 {
        return None;
    }

    let compute_major = parts
        .get(2)
        .and_then(|cap| cap.split('.').next())
        .and_then(|major| major.parse().ok());

    Some(GpuInfo {
        backend: GpuBackend::Cuda,
        name: parts[0].to_string(),
        vram_mb: parts[1].parse().ok()?,
        compute_major,
    })
}

fn detect_metal() -> Option<GpuInfo> {
    // Unified memory: the GPU can address all of system RAM
    let output = Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let mem_bytes: u64 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .ok()?;

    let name = Command::new("sysctl")
        .args(["-n", "machdep.cpu.brand_string"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "Apple Silicon".to_string());

    Some(GpuInfo {
        backend: GpuBackend::Metal,
        name,
        vram_mb: mem_bytes / (1024 * 1024),
        compute_major: None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VramUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl VramUsage {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub ram_percent: Option<f32>,
    pub vram: Option<VramUsage>,
}

impl std::fmt::Display for SystemStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CPU: {:.1}%", self.cpu_percent)?;
        match self.ram_percent {
            Some(ram) => write!(f, " | RAM: {:.1}%", ram)?,
            None => write!(f, " | RAM: N/A")?,
        }
        match self.vram {
            Some(v) => write!(
                f,
                " | VRAM: {:.1}GB / {:.1}GB ({:.0}%)",
                v.used_bytes as f64 / GIB,
                v.total_bytes as f64 / GIB,
                v.percent()
            ),
            None => write!(f, " | VRAM: N/A"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Samples system load. CPU usage is measured between consecutive calls,
/// so the very first sample reports 0%.
///
/// Sampling runs a subprocess and reads /proc; callers on an async runtime
/// should move it to a blocking thread.
#[derive(Debug)]
pub struct SystemMonitor {
    last_cpu: Mutex<Option<CpuTimes>>,
    vram_tool: PathBuf,
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self {
            last_cpu: Mutex::new(None),
            vram_tool: PathBuf::from(VRAM_TOOL),
        }
    }
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query VRAM through `tool` instead of nvidia-smi. It must accept
    /// nvidia-smi's query arguments.
    pub fn with_vram_tool(tool: impl Into<PathBuf>) -> Self {
        Self {
            vram_tool: tool.into(),
            ..Self::default()
        }
    }

    pub fn sample(&self) -> SystemStats {
        SystemStats {
            cpu_percent: self.cpu_percent(),
            ram_percent: read_ram_percent(),
            vram: read_vram(&self.vram_tool),
        }
    }

    fn cpu_percent(&self) -> f32 {
        let Some(now) = read_cpu_times() else {
            return 0.0;
        };
        let mut last = self
            .last_cpu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let percent = last.map(|prev| cpu_delta_percent(prev, now)).unwrap_or(0.0);
        *last = Some(now);
        percent
    }
}

fn cpu_delta_percent(prev: CpuTimes, now: CpuTimes) -> f32 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = now.busy.saturating_sub(prev.busy);
    (busy as f64 / total as f64 * 100.0) as f32
}

fn read_cpu_times() -> Option<CpuTimes> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_times(stat.lines().next()?)
}

/// Aggregate "cpu" line of /proc/stat
fn parse_cpu_times(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|v| v.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total - idle,
        total,
    })
}

fn read_ram_percent() -> Option<f32> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_percent(&meminfo)
}

fn parse_meminfo_percent(meminfo: &str) -> Option<f32> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };

    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(((total.saturating_sub(available)) as f64 / total as f64 * 100.0) as f32)
}

fn read_vram(tool: &Path) -> Option<VramUsage> {
    let output = Command::new(tool)
        .args([
            "--query-gpu=memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    parse_vram_line(String::from_utf8_lossy(&output.stdout).lines().next()?)
}

/// nvidia-smi reports MiB
fn parse_vram_line(line: &str) -> Option<VramUsage> {
    let mut parts = line.split(',').map(str::trim);
    let used: u64 = parts.next()?.parse().ok()?;
    let total: u64 = parts.next()?.parse().ok()?;
    Some(VramUsage {
        used_bytes: used * 1024 * 1024,
        total_bytes: total * 1024 * 1024,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cuda_line() {
        let info = parse_cuda_line("NVIDIA GeForce RTX 5090, 32607, 12.0").unwrap();
        assert_eq!(info.name, "NVIDIA GeForce RTX 5090");
        assert_eq!(info.vram_mb, 32607);
        assert_eq!(info.compute_major, Some(12));
        assert!(info.is_blackwell());

        let older = parse_cuda_line("NVIDIA GeForce RTX 3090, 24576, 8.6").unwrap();
        assert!(!older.is_blackwell());

        assert!(parse_cuda_line("garbage").is_none());
    }

    #[test]
    fn test_cpu_percent_between_samples() {
        let prev = parse_cpu_times("cpu  100 0 100 700 100 0 0 0 0 0").unwrap();
        let now = parse_cpu_times("cpu  200 0 200 1200 100 0 0 0 0 0").unwrap();
        assert_eq!(prev.total, 1000);
        assert_eq!(prev.busy, 200);
        let pct = cpu_delta_percent(prev, now);
        assert!((pct - 28.571).abs() < 0.01, "{}", pct);

        assert_eq!(cpu_delta_percent(now, now), 0.0);
        assert!(parse_cpu_times("cpu0 1 2 3 4").is_none());
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let pct = parse_meminfo_percent(meminfo).unwrap();
        assert!((pct - 75.0).abs() < 0.001);
        assert!(parse_meminfo_percent("MemTotal: 10 kB\n").is_none());
    }

    #[test]
    fn test_stats_display() {
        let stats = SystemStats {
            cpu_percent: 12.5,
            ram_percent: Some(40.0),
            vram: parse_vram_line("8192, 32768"),
        };
        assert_eq!(
            stats.to_string(),
            "CPU: 12.5% | RAM: 40.0% | VRAM: 8.0GB / 32.0GB (25%)"
        );

        let bare = SystemStats {
            cpu_percent: 0.0,
            ram_percent: None,
            vram: None,
        };
        assert_eq!(bare.to_string(), "CPU: 0.0% | RAM: N/A | VRAM: N/A");
    }

    #[test]
    fn test_missing_vram_tool_reports_unavailable() {
        let monitor = SystemMonitor::with_vram_tool("/nonexistent/nvidia-smi");
        assert!(monitor.sample().vram.is_none());
    }
}
