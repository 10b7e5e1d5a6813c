/// Per-request state handed to every pipeline call.
///
/// The credential is resolved by the caller (header, session, config) and
/// carried explicitly so the pipeline never reads ambient state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    credential: Option<String>,
}

impl RequestContext {
    pub fn new(credential: Option<String>) -> Self {
        Self {
            credential: credential
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }
}
