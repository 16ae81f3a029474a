use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HooksError {
    /// A guarded call was made while its busy store reported work in flight.
    #[error("function \"{name}\" was blocked since the store is busy")]
    Blocked { name: String },

    /// An effect callback handed back its cleanup through a future.
    #[error(
        "if the callback of \"{owner}\" needs to return a cleanup function, it must not produce it asynchronously"
    )]
    AsyncCleanup { owner: &'static str },
}
