//! The processing step applied to every application message.

/// Transformation run by the pipeline's process stage.
///
/// Implementations must not block for long: they run on the async runtime.
pub trait Processor: Send + Sync + 'static {
    fn process(&self, message: String) -> String;
}

/// Sends every message back unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Processor for Echo {
    fn process(&self, message: String) -> String {
        message
    }
}

impl<F> Processor for F
where
    F: Fn(String) -> String + Send + Sync + 'static,
{
    fn process(&self, message: String) -> String {
        self(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_echo_is_identity() {
        assert_eq!(Echo.process("hello".into()), "hello");
        assert_eq!(Echo.process(String::new()), "");
    }

    #[test]
    fn test_closure_processor() {
        let upper: Arc<dyn Processor> = Arc::new(|m: String| m.to_uppercase());
        assert_eq!(upper.process("hello".into()), "HELLO");
    }
}
