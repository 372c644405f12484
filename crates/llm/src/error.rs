use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode backend payload on `{stage}`, {source}"))]
    DecodePayload {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("backend reported an error on `{stage}`: {message}"))]
    Backend {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("backend payload on `{stage}` is missing `{field}`"))]
    MissingField {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("`{stage}` requires a non-empty {what}"))]
    EmptyArgument {
        stage: &'static str,
        what: &'static str,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;
