/// Separator placed between retrieved chunks in the context block
pub const CONTEXT_DELIMITER: &str = "\n###\n";

/// Build the generation prompt for a chat message.
///
/// Without context the message is sent as is.
pub fn assemble_prompt<S: AsRef<str>>(message: &str, context_chunks: &[S]) -> String {
    if context_chunks.is_empty() {
        return message.to_string();
    }

    let context = context_chunks
        .iter()
        .map(|chunk| chunk.as_ref())
        .collect::<Vec<&str>>()
        .join(CONTEXT_DELIMITER);

    format!(
        "Use the following context to respond to the message.\ncontext: {}\n###\nmessage: {}\n",
        context, message
    )
}
