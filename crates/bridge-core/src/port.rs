//! Port Custodian — detects a listener conflict on startup, identifies whether
//! the holder is a prior instance of this same program, and if so reclaims the
//! port. Foreign processes are never terminated.

use std::fmt;
use std::time::Duration;

/// Errors the Port Custodian's reclamation procedure can produce.
#[derive(Debug)]
pub enum PortError {
    /// The owning process could not be identified (port appears free on a second check).
    NoProcessFound,
    /// The owning process exists but does not match this program's identity.
    PortHeldByForeignProcess { pid: u32, name: String },
    /// The terminate signal could not be delivered.
    TerminationFailed(String),
    /// The port is still occupied after the bounded retry window.
    StillBusyAfterReclaim,
    /// Underlying OS query failed (reading `/proc`, calling the IP Helper API, ...).
    Io(std::io::Error),
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortError::NoProcessFound => write!(f, "no process found holding the port"),
            PortError::PortHeldByForeignProcess { pid, name } => {
                write!(f, "port held by foreign process {name} (pid {pid})")
            }
            PortError::TerminationFailed(e) => write!(f, "failed to terminate holder: {e}"),
            PortError::StillBusyAfterReclaim => {
                write!(f, "port still busy after reclamation attempt")
            }
            PortError::Io(e) => write!(f, "port query I/O error: {e}"),
        }
    }
}

impl std::error::Error for PortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PortError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PortError {
    fn from(e: std::io::Error) -> Self {
        PortError::Io(e)
    }
}

/// The process holding a listening socket, as resolved by platform-specific means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortHolder {
    pub pid: u32,
    pub exe_name: String,
}

const SETTLE_WAIT: Duration = Duration::from_secs(2);
const RETRY_ATTEMPTS: u32 = 10;
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Run the full reclamation procedure for `port`, permitted to terminate the
/// holder only if its executable name matches one of `program_identity` by
/// prefix.
pub async fn reclaim(port: u16, program_identity: &[String]) -> Result<(), PortError> {
    let holder = find_holder(port)?;

    let is_ours = program_identity
        .iter()
        .any(|id| holder.exe_name.starts_with(id.as_str()));
    if !is_ours {
        return Err(PortError::PortHeldByForeignProcess {
            pid: holder.pid,
            name: holder.exe_name,
        });
    }

    terminate(holder.pid)?;

    tokio::time::sleep(SETTLE_WAIT).await;
    for _ in 0..RETRY_ATTEMPTS {
        if find_holder(port).is_err() {
            return Ok(());
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
    Err(PortError::StillBusyAfterReclaim)
}

#[cfg(target_os = "linux")]
fn find_holder(port: u16) -> Result<PortHolder, PortError> {
    linux::find_holder(port)
}

#[cfg(target_os = "windows")]
fn find_holder(port: u16) -> Result<PortHolder, PortError> {
    windows_backend::find_holder(port)
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn find_holder(_port: u16) -> Result<PortHolder, PortError> {
    Err(PortError::NoProcessFound)
}

#[cfg(target_os = "linux")]
fn terminate(pid: u32) -> Result<(), PortError> {
    linux::terminate(pid)
}

#[cfg(target_os = "windows")]
fn terminate(pid: u32) -> Result<(), PortError> {
    windows_backend::terminate(pid)
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn terminate(_pid: u32) -> Result<(), PortError> {
    Err(PortError::TerminationFailed("unsupported platform".into()))
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{PortError, PortHolder};
    use std::fs;

    /// Parse `/proc/net/tcp` and `/proc/net/tcp6` for the listening socket's
    /// inode on `port`, then walk `/proc/<pid>/fd/*` symlinks looking for
    /// `socket:[inode]`, and read `/proc/<pid>/comm` for the executable name.
    pub fn find_holder(port: u16) -> Result<PortHolder, PortError> {
        let inode = find_listen_inode(port).ok_or(PortError::NoProcessFound)?;
        let pid = find_pid_for_inode(inode).ok_or(PortError::NoProcessFound)?;
        let exe_name = read_comm(pid).unwrap_or_default();
        Ok(PortHolder { pid, exe_name })
    }

    fn find_listen_inode(port: u16) -> Option<u64> {
        for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(contents) = fs::read_to_string(path)
                && let Some(inode) = parse_tcp_table(&contents, port)
            {
                return Some(inode);
            }
        }
        None
    }

    /// `/proc/net/tcp` lines look like:
    /// `  0: 0100007F:1F90 00000000:0000 0A ... <uid> <timer> <inode> ...`
    /// local_address is `<hex IP>:<hex port>`; state `0A` is `TCP_LISTEN`.
    fn parse_tcp_table(contents: &str, port: u16) -> Option<u64> {
        const TCP_LISTEN: &str = "0A";
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            let local_address = fields[1];
            let state = fields[3];
            let inode_field = fields[9];

            let Some((_, hex_port)) = local_address.split_once(':') else {
                continue;
            };
            let Ok(line_port) = u16::from_str_radix(hex_port, 16) else {
                continue;
            };
            if line_port == port
                && state.eq_ignore_ascii_case(TCP_LISTEN)
                && let Ok(inode) = inode_field.parse::<u64>()
            {
                return Some(inode);
            }
        }
        None
    }

    fn find_pid_for_inode(inode: u64) -> Option<u32> {
        let needle = format!("socket:[{inode}]");
        let proc_dir = fs::read_dir("/proc").ok()?;
        for entry in proc_dir.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let fd_dir = entry.path().join("fd");
            let Ok(fds) = fs::read_dir(&fd_dir) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(target) = fs::read_link(fd.path())
                    && target.to_string_lossy() == needle
                {
                    return Some(pid);
                }
            }
        }
        None
    }

    fn read_comm(pid: u32) -> Option<String> {
        fs::read_to_string(format!("/proc/{pid}/comm"))
            .ok()
            .map(|s| s.trim_end().to_string())
    }

    pub fn terminate(pid: u32) -> Result<(), PortError> {
        // SAFETY: kill(2) with a validated pid and SIGTERM; no memory is touched.
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result == 0 {
            Ok(())
        } else {
            Err(PortError::TerminationFailed(
                std::io::Error::last_os_error().to_string(),
            ))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_listening_port_from_tcp_table() {
            let contents = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0";
            assert_eq!(parse_tcp_table(contents, 0x1F90), Some(12345));
        }

        #[test]
        fn ignores_non_listen_state() {
            let contents = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 06 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0";
            assert_eq!(parse_tcp_table(contents, 0x1F90), None);
        }

        #[test]
        fn no_match_for_different_port() {
            let contents = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0";
            assert_eq!(parse_tcp_table(contents, 1234), None);
        }
    }
}

#[cfg(target_os = "windows")]
mod windows_backend {
    use super::{PortError, PortHolder};
    use windows::Win32::Foundation::{CloseHandle, MAX_PATH};
    use windows::Win32::NetworkManagement::IpHelper::{
        GetExtendedTcpTable, MIB_TCPTABLE_OWNER_PID, MIB_TCP_STATE_LISTEN, TCP_TABLE_OWNER_PID_ALL,
    };
    use windows::Win32::Networking::WinSock::AF_INET;
    use windows::Win32::System::ProcessStatus::QueryFullProcessImageNameW;
    use windows::Win32::System::Threading::{
        OpenProcess, TerminateProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE,
    };

    pub fn find_holder(port: u16) -> Result<PortHolder, PortError> {
        let pid = find_pid(port).ok_or(PortError::NoProcessFound)?;
        let exe_name = query_exe_name(pid).unwrap_or_default();
        Ok(PortHolder { pid, exe_name })
    }

    fn find_pid(port: u16) -> Option<u32> {
        let mut size: u32 = 0;
        // SAFETY: first call with a null buffer is the documented way to
        // learn the required size.
        unsafe {
            let _ = GetExtendedTcpTable(
                None,
                &mut size,
                false,
                AF_INET.0 as u32,
                TCP_TABLE_OWNER_PID_ALL,
                0,
            );
        }
        if size == 0 {
            return None;
        }
        let mut buf = vec![0u8; size as usize];
        // SAFETY: buf is sized per the previous call's reported requirement.
        let status = unsafe {
            GetExtendedTcpTable(
                Some(buf.as_mut_ptr() as *mut _),
                &mut size,
                false,
                AF_INET.0 as u32,
                TCP_TABLE_OWNER_PID_ALL,
                0,
            )
        };
        if status != 0 {
            return None;
        }

        // SAFETY: buf was filled by the API as a MIB_TCPTABLE_OWNER_PID.
        let table = unsafe { &*(buf.as_ptr() as *const MIB_TCPTABLE_OWNER_PID) };
        let count = table.dwNumEntries as usize;
        let rows = unsafe {
            std::slice::from_raw_parts(table.table.as_ptr(), count)
        };
        for row in rows {
            let row_port = u16::from_be(row.dwLocalPort as u16);
            if row_port == port && row.dwState == MIB_TCP_STATE_LISTEN.0 as u32 {
                return Some(row.dwOwningPid);
            }
        }
        None
    }

    fn query_exe_name(pid: u32) -> Option<String> {
        // SAFETY: pid is a valid process id obtained from the TCP table.
        let handle =
            unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) }.ok()?;
        let mut buf = [0u16; MAX_PATH as usize];
        let mut len = buf.len() as u32;
        // SAFETY: handle is valid and buf/len describe a correctly sized buffer.
        let ok = unsafe {
            QueryFullProcessImageNameW(
                handle,
                windows::Win32::System::Threading::PROCESS_NAME_WIN32,
                windows::core::PWSTR(buf.as_mut_ptr()),
                &mut len,
            )
        };
        unsafe {
            let _ = CloseHandle(handle);
        }
        if ok.is_err() {
            return None;
        }
        let path = String::from_utf16_lossy(&buf[..len as usize]);
        path.rsplit(['\\', '/']).next().map(|s| s.to_string())
    }

    pub fn terminate(pid: u32) -> Result<(), PortError> {
        // SAFETY: pid is a valid process id obtained from the TCP table.
        let handle = unsafe { OpenProcess(PROCESS_TERMINATE, false, pid) }
            .map_err(|e| PortError::TerminationFailed(e.to_string()))?;
        // SAFETY: handle was just opened with PROCESS_TERMINATE rights.
        let result = unsafe { TerminateProcess(handle, 1) };
        unsafe {
            let _ = CloseHandle(handle);
        }
        result.map_err(|e| PortError::TerminationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_port_held_by_foreign_process() {
        let e = PortError::PortHeldByForeignProcess {
            pid: 42,
            name: "chrome".into(),
        };
        assert_eq!(e.to_string(), "port held by foreign process chrome (pid 42)");
    }

    #[test]
    fn display_still_busy() {
        assert_eq!(
            PortError::StillBusyAfterReclaim.to_string(),
            "port still busy after reclamation attempt"
        );
    }

    #[tokio::test]
    async fn reclaim_rejects_foreign_holder() {
        // On a platform without a real holder at this port, find_holder returns
        // NoProcessFound, which reclaim() surfaces directly rather than ever
        // reaching the identity check; this test documents that contract for
        // the case where a holder *is* found but unrecognized.
        let program_identity = ["BridgeCoordinator".to_string()];
        let holder = PortHolder {
            pid: 1,
            exe_name: "systemd".into(),
        };
        let is_ours = program_identity
            .iter()
            .any(|id| holder.exe_name.starts_with(id.as_str()));
        assert!(!is_ours);
    }

    #[test]
    fn program_identity_prefix_match() {
        let program_identity = ["BridgeCoordinator".to_string()];
        let holder = PortHolder {
            pid: 1,
            exe_name: "BridgeCoordinator-old".into(),
        };
        let is_ours = program_identity
            .iter()
            .any(|id| holder.exe_name.starts_with(id.as_str()));
        assert!(is_ours);
    }
}
