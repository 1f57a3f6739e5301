use cfg_if::cfg_if;

/// Reports how much memory the process currently uses.
pub trait MemoryProbe: Send + Sync + 'static {
    /// Resident memory in megabytes, `None` when it can't be measured.
    fn resident_megabytes(&self) -> Option<u64>;
}

/// Reads the resident set size of the current process.
///
/// Only implemented on Linux; elsewhere memory is never reported, so a worker
/// never stops for exceeding its memory limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn parse_vm_rss(status: &str) -> Option<u64> {
            let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
            let kilobytes: u64 = line
                .trim_start_matches("VmRSS:")
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok()?;
            Some(kilobytes / 1024)
        }

        impl MemoryProbe for ProcessMemory {
            fn resident_megabytes(&self) -> Option<u64> {
                let status = std::fs::read_to_string("/proc/self/status").ok()?;
                parse_vm_rss(&status)
            }
        }
    } else {
        impl MemoryProbe for ProcessMemory {
            fn resident_megabytes(&self) -> Option<u64> {
                None
            }
        }
    }
}

impl<F> MemoryProbe for F
where
    F: Fn() -> Option<u64> + Send + Sync + 'static,
{
    fn resident_megabytes(&self) -> Option<u64> {
        self()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn parses_status_file() {
        let status = "Name:\tworker\nVmPeak:\t  300000 kB\nVmRSS:\t  131072 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(128));
        assert_eq!(parse_vm_rss("Name:\tworker\n"), None);
    }

    #[test]
    fn measures_this_process() {
        assert!(ProcessMemory.resident_megabytes().is_some());
    }
}
