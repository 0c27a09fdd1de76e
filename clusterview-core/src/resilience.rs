//! Timeouts and error classification for calls to cluster members

pub mod timeout {
    //! Timeout configuration for management and directory calls

    use std::time::Duration;

    /// Default timeout for opening a management connection
    pub const MANAGEMENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default timeout for a single management query
    pub const MANAGEMENT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default timeout for directory (registry) operations
    pub const REGISTRY_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Timeout configuration
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimeoutConfig {
        pub connect: Duration,
        pub query: Duration,
        pub registry: Duration,
    }

    impl Default for TimeoutConfig {
        fn default() -> Self {
            Self {
                connect: MANAGEMENT_CONNECT_TIMEOUT,
                query: MANAGEMENT_QUERY_TIMEOUT,
                registry: REGISTRY_OPERATION_TIMEOUT,
            }
        }
    }

    impl TimeoutConfig {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        #[must_use]
        pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
            self.connect = timeout;
            self
        }

        #[must_use]
        pub const fn with_query_timeout(mut self, timeout: Duration) -> Self {
            self.query = timeout;
            self
        }

        #[must_use]
        pub const fn with_registry_timeout(mut self, timeout: Duration) -> Self {
            self.registry = timeout;
            self
        }
    }
}

pub mod retry {
    //! Retry classification

    /// Check if an error looks like a transient network condition
    ///
    /// Checks the error and its sources for known transient I/O error kinds,
    /// then falls back to string matching for wrapped errors.
    pub fn should_retry_error(err: &(dyn std::error::Error + 'static)) -> bool {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                return is_transient_io_error(io_err);
            }
            current = e.source();
        }

        let err_msg = err.to_string().to_lowercase();
        err_msg.contains("timed out")
            || err_msg.contains("timeout")
            || err_msg.contains("connection reset")
            || err_msg.contains("connection refused")
            || err_msg.contains("connection aborted")
            || err_msg.contains("broken pipe")
    }

    fn is_transient_io_error(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        )
    }
}
