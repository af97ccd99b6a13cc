/// Implement `Display` for a serializable type as its JSON rendering,
/// falling back to `Debug` if serialization fails.
#[macro_export]
macro_rules! impl_display_using_json {
    ($type:ty) => {
        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match serde_json::to_string(self) {
                    Ok(s) => write!(f, "{}", s),
                    Err(_) => write!(f, "{:?}", self),
                }
            }
        }
    };
}
