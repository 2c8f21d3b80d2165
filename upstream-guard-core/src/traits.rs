use crate::domain::PipelineRequest;

/// Domain-specific request validation (symbol syntax, date formats, ...)
/// consulted before the pipeline touches any shared state.
pub trait InputValidator: Send + Sync {
    /// Returns a human-readable reason when the request must be rejected.
    fn validate(&self, request: &PipelineRequest) -> Result<(), String>;
}

/// Accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl InputValidator for AcceptAll {
    fn validate(&self, _request: &PipelineRequest) -> Result<(), String> {
        Ok(())
    }
}

/// Adapts a closure into an [`InputValidator`].
pub struct FnValidator<F>(pub F);

impl<F> InputValidator for FnValidator<F>
where
    F: Fn(&PipelineRequest) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, request: &PipelineRequest) -> Result<(), String> {
        (self.0)(request)
    }
}
