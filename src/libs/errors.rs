//! The error type for the autoscaler

use reqwest::StatusCode;

/// An error from the autoscaler
#[derive(Debug)]
pub enum Error {
    /// An error returned by an Azure management or storage endpoint
    Azure {
        code: StatusCode,
        msg: Option<String>,
    },
    /// A generic error with a message
    Generic(String),
    /// An error from sending or recieving a request
    Reqwest(reqwest::Error),
    /// An IO Error
    IO(std::io::Error),
    /// An error from the k8s client
    K8s(kube::Error),
    /// An error from loading a kubeconfig
    K8sConfig(kube::config::KubeconfigError),
    /// An error from inferring an in-cluster k8s config
    K8sInfer(kube::config::InferConfigError),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from using a regex
    Regex(regex::Error),
    /// An error from parsing an int
    ParseInt(std::num::ParseIntError),
    /// An error from joining a tokio task
    JoinError(tokio::task::JoinError),
    /// A node name that does not follow the k8s-<pool>-<cluster>-<index> scheme
    MalformedNodeName(String),
    /// An ARM template missing a resource the transformer must anchor on
    TemplateShape(String),
    /// An instance type that is not listed in the capacity catalog
    MissingInstanceType(String),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Get the status code from this error if one exists
    pub fn status(&self) -> Option<StatusCode> {
        // get the status code from any error types that support it
        match self {
            Error::Azure { code, .. } => Some(code.to_owned()),
            Error::Reqwest(err) => err.status(),
            Error::K8s(err) => match err {
                kube::Error::Api(resp) => StatusCode::from_u16(resp.code).ok(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Get the error message for this error if one exists
    pub fn msg(&self) -> Option<String> {
        // get the msg from any error types that support it
        match self {
            Error::Azure { msg, .. } => msg.clone(),
            Error::Generic(msg) => Some(msg.clone()),
            Error::Reqwest(err) => Some(err.to_string()),
            Error::IO(err) => Some(err.to_string()),
            Error::K8s(err) => Some(err.to_string()),
            Error::K8sConfig(err) => Some(err.to_string()),
            Error::K8sInfer(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::Config(err) => Some(err.to_string()),
            Error::Regex(err) => Some(err.to_string()),
            Error::ParseInt(err) => Some(err.to_string()),
            Error::JoinError(err) => Some(err.to_string()),
            Error::MalformedNodeName(name) => {
                Some(format!("Node name {} is malformed", name))
            }
            Error::TemplateShape(msg) => Some(msg.clone()),
            Error::MissingInstanceType(kind) => {
                Some(format!("Instance type {} is not in the capacity catalog", kind))
            }
        }
    }

    /// Get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Azure { .. } => "Azure",
            Error::Generic(_) => "Generic",
            Error::Reqwest(_) => "Reqwest",
            Error::IO(_) => "IO",
            Error::K8s(_) => "K8s",
            Error::K8sConfig(_) => "K8sConfig",
            Error::K8sInfer(_) => "K8sInfer",
            Error::Serde(_) => "Serde",
            Error::Config(_) => "Config",
            Error::Regex(_) => "Regex",
            Error::ParseInt(_) => "ParseInt",
            Error::JoinError(_) => "JoinError",
            Error::MalformedNodeName(_) => "MalformedNodeName",
            Error::TemplateShape(_) => "TemplateShape",
            Error::MissingInstanceType(_) => "MissingInstanceType",
        }
    }

    /// Whether a failed cloud call is worth retrying in place
    pub fn is_transient(&self) -> bool {
        match self.status() {
            Some(code) => code.is_server_error() || code == StatusCode::TOO_MANY_REQUESTS,
            // connection level failures have no status and may clear up
            None => matches!(self, Error::Reqwest(_)),
        }
    }
}

impl std::fmt::Display for Error {
    /// Display this error in an easily readable format
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match (self.status(), self.msg()) {
            (Some(code), Some(msg)) => write!(f, "Code: {} Error: {}", code, msg),
            (None, Some(msg)) => write!(f, "Error: {}", msg),
            (Some(code), None) => write!(f, "Code: {}", code),
            (None, None) => write!(f, "Kind: {}", self.kind()),
        }
    }
}

// mark that this is an error struct
impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Reqwest(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        Error::K8s(error)
    }
}

impl From<kube::config::KubeconfigError> for Error {
    fn from(error: kube::config::KubeconfigError) -> Self {
        Error::K8sConfig(error)
    }
}

impl From<kube::config::InferConfigError> for Error {
    fn from(error: kube::config::InferConfigError) -> Self {
        Error::K8sInfer(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Error::Regex(error)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error::ParseInt(error)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::JoinError(error)
    }
}
