//! `async fn serve(&self, Input) -> Result<Output, Error>`
//!
//! The seam between a listener and whatever handles its connections.
//! Heavily inspired by [tower-service](https://docs.rs/tower-service)
//! and the vast [Tokio](https://docs.rs/tokio) ecosystem which makes use
//! of it, reduced to the one shape a drain-aware server needs.

use std::sync::Arc;

/// A service that asynchronously turns an input (typically a freshly
/// accepted connection) into an output.
pub trait Service<Input>: Sized + Send + Sync + 'static {
    /// The type of output produced by the service.
    type Output: Send + 'static;

    /// The type of error returned by the service.
    type Error: Send + 'static;

    /// Serve an output or error for the given input.
    fn serve(
        &self,
        input: Input,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send + '_;
}

impl<S, Input> Service<Input> for Arc<S>
where
    S: Service<Input>,
{
    type Output = S::Output;
    type Error = S::Error;

    fn serve(
        &self,
        input: Input,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send + '_ {
        (**self).serve(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Service<u32> for Echo {
        type Output = u32;
        type Error = std::convert::Infallible;

        async fn serve(&self, input: u32) -> Result<u32, Self::Error> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn arc_service_delegates() {
        let service = Arc::new(Echo);
        assert_eq!(42, service.serve(42).await.unwrap());
    }
}
