use serde_json::{Value, json};

use crate::catalog::Product;
use crate::transport::ChatMessage;

pub const ROUTINE_SYSTEM_PROMPT: &str =
    "You are a L'Oréal beauty advisor expert. Create a personalized routine based on the selected products.";

/// Seeds the conversation once a routine exists.
pub const ROUTINE_SCOPE_PROMPT: &str = "You are a L'Oréal beauty advisor expert. Only answer questions related to the previously generated routine, skincare, haircare, makeup, beauty products, or L'Oréal brands.";

/// Prepended to every follow-up request, ahead of the stored history.
pub const FOLLOW_UP_SYSTEM_PROMPT: &str = "You are a L'Oréal beauty advisor expert. Only answer questions related to the previously generated routine, skincare, haircare, makeup, beauty products, or L'Oréal brands. If the question is unrelated, politely explain that you can only discuss beauty-related topics and the current routine.";

/// The part of a product the assistant gets to see. Ids and images stay out
/// of the prompt.
fn summary(p: &Product) -> Value {
    json!({
        "name": p.name,
        "brand": p.brand,
        "category": p.category,
        "description": p.description,
    })
}

pub fn routine_request(products: &[Product]) -> Vec<ChatMessage> {
    let payload = Value::Array(products.iter().map(summary).collect());
    vec![
        ChatMessage::system(ROUTINE_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Create a personalized routine using these products: {}",
            payload
        )),
    ]
}

pub fn follow_up_request(history: &[ChatMessage], user_message: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(FOLLOW_UP_SYSTEM_PROMPT));
    messages.extend_from_slice(history);
    messages.push(ChatMessage::user(user_message));
    messages
}

pub fn seeded_history(routine: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::system(ROUTINE_SCOPE_PROMPT), ChatMessage::assistant(routine)]
}
