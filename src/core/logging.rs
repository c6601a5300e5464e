//! Request-scoped logging context.
//!
//! The middleware scopes the request id and the chat handler scopes the caller
//! identity into task-locals, so log lines emitted deeper in the call stack
//! (the upstream client, for one) can carry them without threading them
//! through every call.

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the authenticated caller identity.
    pub static USER_ID: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current caller identity, or "anonymous" outside a request scope.
pub fn get_user_id() -> String {
    USER_ID
        .try_with(|user| user.clone())
        .unwrap_or_else(|_| "anonymous".to_string())
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Execute an async block with request context (request_id and user_id).
///
/// # Example
///
/// ```ignore
/// with_request_context!(request_id, user_id, async {
///     // handler logic here
/// })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $user_id:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::USER_ID.scope($user_id, $body).await
            })
            .await
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_defaults_outside_scope() {
        assert_eq!(get_request_id(), "");
        assert_eq!(get_user_id(), "anonymous");
    }

    #[tokio::test]
    async fn test_with_request_context_macro() {
        let seen = crate::with_request_context!(
            "req-1".to_string(),
            "client_mobile".to_string(),
            async { (get_request_id(), get_user_id()) }
        );
        assert_eq!(seen.0, "req-1");
        assert_eq!(seen.1, "client_mobile");
    }

    #[tokio::test]
    async fn test_context_isolation() {
        let a = tokio::spawn(REQUEST_ID.scope("a".to_string(), async { get_request_id() }));
        let b = tokio::spawn(REQUEST_ID.scope("b".to_string(), async { get_request_id() }));
        assert_eq!(a.await.unwrap(), "a");
        assert_eq!(b.await.unwrap(), "b");
    }

    #[test]
    fn test_generate_request_id_is_uuid() {
        let id = generate_request_id();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_ne!(id, generate_request_id());
    }
}
