//! Process restrictions applied at startup.

use std::io;

use tracing::{info, warn};

/// Files created by the gateway are not accessible to other users.
#[cfg(unix)]
pub fn restrict_umask() {
    // SAFETY: umask only changes the file mode creation mask of this process
    unsafe {
        libc::umask(0o007);
    }
}

#[cfg(not(unix))]
pub fn restrict_umask() {}

/// Forbid gaining privileges through exec, as required before a seccomp
/// filter can be installed without CAP_SYS_ADMIN.
#[cfg(target_os = "linux")]
pub fn no_new_privs() -> io::Result<()> {
    let (on, unused): (libc::c_ulong, libc::c_ulong) = (1, 0);
    // SAFETY: PR_SET_NO_NEW_PRIVS takes integer arguments only
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, on, unused, unused, unused) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn no_new_privs() -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "no_new_privs requires Linux"))
}

/// Apply the seccomp section of the configuration.
pub fn apply_seccomp(enabled: bool) -> io::Result<()> {
    if !enabled {
        return Ok(());
    }
    no_new_privs()?;
    info!("no_new_privs set");
    warn!("the system call allow-list itself must be installed by the service manager (SystemCallFilter=)");
    Ok(())
}
