//! Port pattern expansion.

use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::modem::PortOpener;

/// Expand `pattern` into device paths, sorted lexicographically.
///
/// `*` and `?` are allowed in the file name only. A pattern without
/// wildcards is returned as is, whether or not it exists.
pub async fn candidates(opener: &dyn PortOpener, pattern: &str) -> io::Result<Vec<PathBuf>> {
    let path = Path::new(pattern);
    if !pattern.contains(['*', '?']) {
        return Ok(vec![path.to_path_buf()]);
    }

    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(invalid(pattern));
    };
    if dir.to_string_lossy().contains(['*', '?']) {
        return Err(invalid(pattern));
    }

    let matcher = glob_regex(&name.to_string_lossy()).map_err(|_| invalid(pattern))?;
    let mut found: Vec<PathBuf> = opener
        .list(dir)
        .await?
        .into_iter()
        .filter(|candidate| {
            candidate
                .file_name()
                .is_some_and(|n| matcher.is_match(&n.to_string_lossy()))
        })
        .collect();

    found.sort();
    found.dedup();
    Ok(found)
}

fn glob_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(glob.len() + 8);
    expr.push('^');
    for c in glob.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

fn invalid(pattern: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("wildcards are only supported in the file name: {pattern}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::mock::{SimulatedModem, SimulatedPorts};

    fn ports() -> SimulatedPorts {
        let ports = SimulatedPorts::new();
        for name in ["ttyUSB10", "ttyUSB2", "ttyUSB0", "ttyACM0", "ttyS0"] {
            ports.plug(format!("/dev/{name}"), SimulatedModem::new("1"));
        }
        ports
    }

    #[tokio::test]
    async fn test_wildcard_sorted() {
        let found = candidates(&ports(), "/dev/ttyUSB*").await.unwrap();
        assert_eq!(
            found,
            vec![
                PathBuf::from("/dev/ttyUSB0"),
                PathBuf::from("/dev/ttyUSB10"),
                PathBuf::from("/dev/ttyUSB2"),
            ]
        );
    }

    #[tokio::test]
    async fn test_single_character_wildcard() {
        let found = candidates(&ports(), "/dev/ttyUSB?").await.unwrap();
        assert_eq!(found, vec![PathBuf::from("/dev/ttyUSB0"), PathBuf::from("/dev/ttyUSB2")]);
    }

    #[tokio::test]
    async fn test_fixed_path_used_directly() {
        let found = candidates(&ports(), "/dev/ttyUSB7").await.unwrap();
        assert_eq!(found, vec![PathBuf::from("/dev/ttyUSB7")]);
    }

    #[tokio::test]
    async fn test_wildcard_in_directory_rejected() {
        let err = candidates(&ports(), "/dev/*/ttyUSB0").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_glob_escapes_regex_syntax() {
        let re = glob_regex("tty.USB+*").unwrap();
        assert!(re.is_match("tty.USB+3"));
        assert!(!re.is_match("ttyXUSB+3"));
    }
}
