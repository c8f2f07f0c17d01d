use std::fmt;

use super::Scanner;
use crate::utils::format_time_as_elapsed;

/// Renderable view of the scanner's tables, in the shape the `show ip
/// bgp scan [detail]` command prints
pub struct ScanTables<'a> {
    scanner: &'a Scanner,
    detail: bool,
}

impl<'a> fmt::Display for ScanTables<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scanner = self.scanner;
        if scanner.running {
            writeln!(f, "BGP scan is running")?;
        } else {
            writeln!(f, "BGP scan is not running")?;
        }
        writeln!(f, "BGP scan interval is {}", scanner.scan_interval)?;
        if let Some(last_scan) = scanner.last_scan {
            writeln!(f, "Last scan was {} ago", format_time_as_elapsed(last_scan))?;
        }

        writeln!(f, "Current BGP nexthop cache:")?;
        for (prefix, entry) in scanner.cache4.active().iter() {
            if entry.valid {
                writeln!(f, " {} valid [IGP metric {}]", prefix.addr(), entry.metric)?;
                if self.detail {
                    for nexthop in &entry.nexthops {
                        writeln!(f, "  {}", nexthop)?;
                    }
                }
            } else {
                writeln!(f, " {} invalid", prefix.addr())?;
            }
        }
        for (prefix, entry) in scanner.cache6.active().iter() {
            if entry.valid {
                writeln!(f, " {} valid [IGP metric {}]", prefix.addr(), entry.metric)?;
                if self.detail {
                    for nexthop in &entry.nexthops {
                        writeln!(f, "  {}", nexthop)?;
                    }
                }
            } else {
                writeln!(f, " {} invalid", prefix.addr())?;
            }
        }

        writeln!(f, "BGP connected route:")?;
        for prefix in self.scanner.connected.v4.iter() {
            writeln!(f, " {}", prefix)?;
        }
        for prefix in self.scanner.connected.v6.iter() {
            writeln!(f, " {}", prefix)?;
        }
        Ok(())
    }
}

impl Scanner {
    pub fn scan_tables(&self, detail: bool) -> ScanTables {
        ScanTables {
            scanner: self,
            detail,
        }
    }

    pub fn show(&self, detail: bool) -> String {
        self.scan_tables(detail).to_string()
    }
}
