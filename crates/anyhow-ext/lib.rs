pub use anyhow::*;

pub trait ErrorExt {
    fn any_is<T>(&self) -> bool
    where
        T: std::error::Error + Send + Sync + 'static;
    fn any_downcast_ref<T>(&self) -> Option<&T>
    where
        T: std::error::Error + Send + Sync + 'static;
}

impl ErrorExt for anyhow::Error {
    #[expect(
        clippy::disallowed_methods,
        reason = "We are implementing the alternative."
    )]
    fn any_is<T>(&self) -> bool
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        self.is::<T>() || self.chain().any(|e| e.is::<T>())
    }

    #[expect(
        clippy::disallowed_methods,
        reason = "We are implementing the alternative."
    )]
    fn any_downcast_ref<T>(&self) -> Option<&T>
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        std::iter::empty()
            .chain(self.downcast_ref::<T>())
            .chain(self.chain().flat_map(|e| e.downcast_ref::<T>()))
            .next()
    }
}
