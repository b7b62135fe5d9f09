pub mod message_store;
pub mod models;

pub use message_store::MessageStore;
pub use models::{
    Conversation, ConversationKey, ConversationSummary, MessageDeletion, MessageKind,
    StoredMessage,
};
