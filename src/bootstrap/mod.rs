mod hardening;
mod server;
mod shutdown;

pub use hardening::{apply_seccomp, no_new_privs, restrict_umask};
pub use server::Server;
pub use shutdown::Shutdown;
