use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("forge command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("forge command returned non-zero exit ({command}) status={status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("forge command output was not valid UTF-8 ({command}, {stream}): {source}")]
    NonUtf8Output {
        command: String,
        stream: &'static str,
        #[source]
        source: FromUtf8Error,
    },
    #[error("could not parse forge response for {command}: {context}")]
    Parse { command: String, context: String },
}
