//! Cache, lock and coalescing key layout.

pub fn user_by_id(id: i64) -> String {
    format!("user:id:{id}")
}

pub fn user_by_username(username: &str) -> String {
    format!("user:username:{username}")
}

pub fn product_by_id(id: i64) -> String {
    format!("product:id:{id}")
}

pub fn order_by_id(id: i64) -> String {
    format!("order:id:{id}")
}

/// List of a user's order ids, oldest first.
pub fn orders_of_user(user_id: i64) -> String {
    format!("order:user:{user_id}")
}

/// Chat transcript of one session, oldest first.
pub fn chat_session(session_id: &str) -> String {
    format!("chat:session:{session_id}")
}

/// Repopulation lock guarding `cache_key`.
pub fn lock_for(cache_key: &str) -> String {
    format!("{cache_key}:lock")
}
