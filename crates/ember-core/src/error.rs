//! Error types for the Ember rendering core

use std::collections::BTreeMap;
use thiserror::Error;

/// Context information for errors to aid in debugging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Operation that was being performed when the error occurred
    pub operation: String,
    /// Component or module where the error occurred
    pub component: String,
    /// Additional contextual data
    pub metadata: BTreeMap<String, String>,
    /// Call path if available
    pub call_path: Option<String>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            component: component.into(),
            metadata: BTreeMap::new(),
            call_path: None,
        }
    }

    /// Add metadata to the context
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Add call path information
    pub fn with_call_path(mut self, path: impl Into<String>) -> Self {
        self.call_path = Some(path.into());
        self
    }

    /// Format context for logging
    pub fn format_for_log(&self) -> String {
        let mut parts = vec![
            format!("operation={}", self.operation),
            format!("component={}", self.component),
        ];

        if !self.metadata.is_empty() {
            let metadata_str = self
                .metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("metadata=[{}]", metadata_str));
        }

        if let Some(ref path) = self.call_path {
            parts.push(format!("call_path={}", path));
        }

        parts.join(", ")
    }
}

/// Main error type for the rendering core.
///
/// The variants follow the engine's failure taxonomy:
///
/// - [`EmberError::Allocation`] and [`EmberError::DeviceRemoved`] are fatal.
///   They are never retried and abort initialization or the frame loop.
/// - [`EmberError::ContractViolation`] marks a programming error (recording
///   into a closed context, rendering an uninitialized pass, binding a
///   resource in the wrong state).
/// - [`EmberError::CapacityExceeded`] reports a full fixed-capacity pool.
#[derive(Debug, Error)]
pub enum EmberError {
    #[error("Allocation failed: {message}")]
    Allocation {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Capacity exceeded: {message}")]
    CapacityExceeded {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Contract violation: {message}")]
    ContractViolation {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Device removed: {message}")]
    DeviceRemoved {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("Image decode error: {message}")]
    Image {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmberError {
    /// Create an allocation error from a string
    pub fn allocation<S: Into<String>>(msg: S) -> Self {
        Self::Allocation {
            message: msg.into(),
            context: None,
        }
    }

    /// Create a capacity error from a string
    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        Self::CapacityExceeded {
            message: msg.into(),
            context: None,
        }
    }

    /// Create a contract violation from a string
    pub fn contract<S: Into<String>>(msg: S) -> Self {
        Self::ContractViolation {
            message: msg.into(),
            context: None,
        }
    }

    /// Create a device removed error from a string
    pub fn device_removed<S: Into<String>>(msg: S) -> Self {
        Self::DeviceRemoved {
            message: msg.into(),
            context: None,
        }
    }

    /// Create a configuration error from a string
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration {
            message: msg.into(),
            context: None,
        }
    }

    /// Create an image decode error from a string
    pub fn image<S: Into<String>>(msg: S) -> Self {
        Self::Image {
            message: msg.into(),
            context: None,
        }
    }

    /// Attach a context to this error, replacing any previous one
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        match &mut self {
            Self::Allocation { context, .. }
            | Self::CapacityExceeded { context, .. }
            | Self::ContractViolation { context, .. }
            | Self::DeviceRemoved { context, .. }
            | Self::Configuration { context, .. }
            | Self::Image { context, .. } => *context = Some(ctx),
            Self::Io(_) => {}
        }
        self
    }

    /// Get the error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Allocation { context, .. }
            | Self::CapacityExceeded { context, .. }
            | Self::ContractViolation { context, .. }
            | Self::DeviceRemoved { context, .. }
            | Self::Configuration { context, .. }
            | Self::Image { context, .. } => context.as_ref(),
            Self::Io(_) => None,
        }
    }

    /// Whether the engine can continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Allocation { .. } | Self::DeviceRemoved { .. })
    }

    /// Whether this error reports a programming mistake
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation { .. })
    }

    /// Format error with context for logging
    pub fn format_for_log(&self) -> String {
        let base_msg = self.to_string();
        if let Some(context) = self.context() {
            format!("{} [{}]", base_msg, context.format_for_log())
        } else {
            base_msg
        }
    }
}

/// Result type alias for Ember operations
pub type Result<T> = std::result::Result<T, EmberError>;
