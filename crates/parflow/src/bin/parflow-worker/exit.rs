use std::fmt;
use std::io;

use parflow::remote::RemoteError;
use parflow::PoolError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn remote_error(context: &str, err: RemoteError) -> CliError {
    match err {
        RemoteError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        RemoteError::Channel(_) | RemoteError::ServiceClosed => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        RemoteError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn pool_error(context: &str, err: PoolError) -> CliError {
    match err {
        PoolError::Io(source) => io_error(context, source),
        PoolError::Remote(source) => remote_error(context, source),
        PoolError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        PoolError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn maps_errors_to_exit_codes() {
        assert_eq!(
            pool_error("w", PoolError::Remote(RemoteError::Timeout(Duration::from_secs(1)))).code,
            TIMEOUT
        );
        assert_eq!(
            pool_error("w", PoolError::Remote(RemoteError::ServiceClosed)).code,
            TRANSPORT_ERROR
        );
        assert_eq!(
            pool_error("w", PoolError::Io(io::Error::from(io::ErrorKind::ConnectionRefused))).code,
            TRANSPORT_ERROR
        );
        assert_eq!(pool_error("w", PoolError::Worker("x".into())).code, FAILURE);
        assert!(pool_error("w", PoolError::Worker("x".into()))
            .to_string()
            .starts_with("w: "));
    }
}
