use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum McpvmError {
    #[error("failed to load config from {path}")]
    #[diagnostic(help(
        "create the file with your subscription credentials:\n  org = \"<organization id>\"\n  activation_key = \"<activation key>\""
    ))]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("required tool '{tool}' is not available")]
    #[diagnostic(help("{hint}"))]
    MissingTool { tool: String, hint: String },

    #[error("base image for {version} not found at {path}")]
    #[diagnostic(help("download the {version} cloud image from {url} and place it at {path}"))]
    MissingBaseImage {
        version: String,
        path: String,
        url: String,
    },

    #[error("a VM named '{name}' already exists")]
    #[diagnostic(help("pick another name, or remove the old VM with `mcpvm delete {name}`"))]
    DuplicateVm { name: String },

    #[error("no VM named '{name}'")]
    #[diagnostic(help("`mcpvm list` shows the VMs this tool knows about"))]
    VmNotFound { name: String },

    #[error("{backend} operation failed: {message}")]
    #[diagnostic(help("{hint}"))]
    Backend {
        backend: &'static str,
        message: String,
        hint: String,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("no usable SSH public key")]
    #[diagnostic(help("generate one with `ssh-keygen -t ed25519` (looked for {searched})"))]
    SshKeyMissing { searched: String },

    #[error("could not generate a free VM name after {attempts} attempts")]
    #[diagnostic(help("supply a name explicitly: `mcpvm setup --version=<X.Y> <name>`"))]
    NameGeneration { attempts: u32 },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl McpvmError {
    /// Wrap an io::Error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        McpvmError::Io {
            context: context.into(),
            source,
        }
    }
}
