use std::fmt::{Debug, Display};

use backtrace::Backtrace;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error as ThisError;

/// An error from the transactional runtime as well as an associated
/// backtrace.
pub struct Error {
    /// The error that occurred.
    pub kind: ErrorKind,

    backtrace: Mutex<Backtrace>,
}

impl Error {
    /// Returns the backtrace of where this error was created.
    pub fn backtrace(&self) -> MutexGuard<'_, Backtrace> {
        let mut backtrace = self.backtrace.lock();
        backtrace.resolve();
        backtrace
    }

    fn format_backtrace_frames(&self) -> Vec<String> {
        let mut backtrace = self.backtrace.lock();
        backtrace.resolve();
        backtrace
            .frames()
            .iter()
            .filter_map(|frame| frame.symbols().first())
            .enumerate()
            .map(|(index, symbol)| {
                let mut line = format!("{index}: ");
                if let Some(name) = symbol.name() {
                    line.push_str(&name.to_string());
                    line.push(' ');
                } else if let Some(addr) = symbol.addr() {
                    line.push_str(&format!("{:x}", addr as usize));
                    line.push(' ');
                } else {
                    // Give up on formatting this one.
                    line.push_str(&format!("{symbol:?}"));
                    return line;
                }

                if let Some(file) = symbol.filename() {
                    if let Some(file) = file.to_str() {
                        line.push_str("at ");
                        line.push_str(file);
                    } else {
                        line.push_str(&format!("at {file:?}"));
                    }

                    if let Some(lineno) = symbol.lineno() {
                        line.push(':');
                        line.push_str(&lineno.to_string());
                        if let Some(col) = symbol.colno() {
                            line.push(':');
                            line.push_str(&col.to_string());
                        }
                    }
                }
                line
            })
            .collect()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.kind, f)?;

        #[cfg(debug_assertions)]
        {
            f.write_str("\nstack backtrace:")?;

            for (index, frame) in self.format_backtrace_frames().into_iter().enumerate() {
                write!(f, "{index}: {frame}")?;
            }
        }

        Ok(())
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frames = self.format_backtrace_frames();
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("backtrace", &&frames[..])
            .finish()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            backtrace: Mutex::new(Backtrace::new_unresolved()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::from(ErrorKind::from(err))
    }
}

impl From<&'static str> for Error {
    fn from(message: &'static str) -> Self {
        Self::from(ErrorKind::message(message))
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::from(ErrorKind::message(message))
    }
}

impl From<flume::RecvError> for Error {
    fn from(_err: flume::RecvError) -> Self {
        Self::from(ErrorKind::Internal(InternalError::InternalCommunication))
    }
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(_err: flume::SendError<T>) -> Self {
        Self::from(ErrorKind::Internal(InternalError::InternalCommunication))
    }
}

/// An error from the transactional runtime.
#[derive(Debug, ThisError)]
#[error(transparent)]
pub enum ErrorKind {
    /// An error has occurred. The string contains a human-readable error
    /// message. This error is only used in situations where a user is not
    /// expected to be able to recover automatically from the error.
    #[error("{0}")]
    Message(String),
    /// An error occurred while performing IO against a log file or the
    /// persistent epoch marker. Because durability has been promised by the
    /// time log IO is issued, these errors are fatal.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// An invalid configuration was rejected during initialization.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A log record was larger than a log buffer can hold.
    #[error("log record too large")]
    RecordTooLarge,
    /// The runtime is stopping; background threads and new transactions
    /// receive this while shutdown is in progress.
    #[error("the runtime is shutting down")]
    Shutdown,
    /// An internal error occurred. These errors are not intended to be
    /// recoverable and represent some internal invariant violation.
    #[error("an internal error occurred: {0}")]
    Internal(InternalError),
}

impl ErrorKind {
    pub(crate) fn message<S: Display>(message: S) -> Self {
        Self::Message(message.to_string())
    }
}

impl From<&'static str> for ErrorKind {
    fn from(message: &'static str) -> Self {
        Self::message(message)
    }
}

impl From<String> for ErrorKind {
    fn from(message: String) -> Self {
        Self::message(message)
    }
}

impl From<flume::RecvError> for ErrorKind {
    fn from(_err: flume::RecvError) -> Self {
        Self::Internal(InternalError::InternalCommunication)
    }
}

impl<T> From<flume::SendError<T>> for ErrorKind {
    fn from(_err: flume::SendError<T>) -> Self {
        Self::Internal(InternalError::InternalCommunication)
    }
}

/// An internal invariant violation.
#[derive(Debug, ThisError)]
pub enum InternalError {
    /// A worker attempted to begin a transaction while another was active.
    #[error("the worker already has an active transaction")]
    WorkerBusy,
    /// The system-wide durable epoch would have moved backwards.
    #[error("the durable epoch regressed")]
    EpochRegression,
    /// A log buffer was observed in a state that violates the buffer
    /// ownership protocol.
    #[error("log buffer state corrupted")]
    BufferStateCorrupted,
    /// An error on an internal channel has occurred.
    #[error("an error on an internal channel has occurred")]
    InternalCommunication,
}
