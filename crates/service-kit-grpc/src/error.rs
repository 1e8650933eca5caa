//! Error handling utilities for gRPC.

use tonic::{Code, Status};

/// Boxed error used at the tower service boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for converting errors into gRPC Status responses.
///
/// # Example
///
/// ```ignore
/// use service_kit_grpc::GrpcError;
/// use tonic::{Code, Status};
///
/// #[derive(Debug)]
/// enum AppError {
///     NotFound(String),
/// }
///
/// impl GrpcError for AppError {
///     fn code(&self) -> Code {
///         Code::NotFound
///     }
///
///     fn message(&self) -> &str {
///         match self {
///             Self::NotFound(msg) => msg,
///         }
///     }
/// }
/// ```
pub trait GrpcError: std::fmt::Debug {
    fn code(&self) -> Code;
    fn message(&self) -> &str;

    fn into_status(self) -> Status
    where
        Self: Sized,
    {
        Status::new(self.code(), self.message())
    }
}

/// Crate-level error type.
#[derive(Debug)]
pub enum Error {
    Config(service_kit::ConfigError),
    InvalidEndpoint(String),
    Connection(String),
    Server(ServerError),
    Shutdown(ShutdownError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Configuration error: {}", e),
            Self::InvalidEndpoint(e) => write!(f, "Invalid endpoint: {}", e),
            Self::Connection(e) => write!(f, "Connection error: {}", e),
            Self::Server(e) => write!(f, "Server error: {}", e),
            Self::Shutdown(e) => write!(f, "Shutdown error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<service_kit::ConfigError> for Error {
    fn from(err: service_kit::ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Self::Server(err)
    }
}

impl From<ShutdownError> for Error {
    fn from(err: ShutdownError) -> Self {
        Self::Shutdown(err)
    }
}

/// Server-specific errors.
#[derive(Debug)]
pub enum ServerError {
    /// The configured address is empty or cannot be resolved.
    InvalidAddress(String),
    Bind(std::io::Error),
    /// The listener failed in a way that retrying cannot fix.
    Accept(std::io::Error),
    /// The pre-start callback rejected startup.
    PreStart(BoxError),
    /// A registered file descriptor set could not be decoded.
    Reflection(String),
    AlreadyServing,
    Stopped,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAddress(e) => write!(f, "Invalid address: {}", e),
            Self::Bind(e) => write!(f, "Failed to bind: {}", e),
            Self::Accept(e) => write!(f, "Failed to accept connection: {}", e),
            Self::PreStart(e) => write!(f, "Pre-start callback failed: {}", e),
            Self::Reflection(e) => write!(f, "Failed to build reflection service: {}", e),
            Self::AlreadyServing => write!(f, "Server is already serving"),
            Self::Stopped => write!(f, "Server has been stopped"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(e) | Self::Accept(e) => Some(e),
            Self::PreStart(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Which step of the shutdown sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    GracefulShutdownHandler,
    TracerProviderShutdown,
}

impl std::fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GracefulShutdownHandler => f.write_str("graceful shutdown handler"),
            Self::TracerProviderShutdown => f.write_str("tracer provider shutdown"),
        }
    }
}

/// Failures collected while running the shutdown sequence.
///
/// Every step is attempted even when an earlier one fails.
#[derive(Debug)]
pub struct ShutdownError {
    pub failures: Vec<(ShutdownStep, BoxError)>,
}

impl ShutdownError {
    pub fn failed_steps(&self) -> impl Iterator<Item = ShutdownStep> + '_ {
        self.failures.iter().map(|(step, _)| *step)
    }
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (step, err)) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} failed: {}", step, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}
