//! 外部协作者：文本模型、邮件、关系存储、联网检索与知识索引

pub mod knowledge;
pub mod mock;
pub mod openai;
pub mod search;
pub mod sqlite;
pub mod traits;

pub use knowledge::{HashEmbedder, LocalKnowledgeIndex};
pub use mock::{
    MockKnowledgeIndex, MockMailConnector, MockMailbox, MockSearchProvider, MockStoreConnector,
    MockStoreLog, MockTextModel, RecordedQuery, SentMail,
};
pub use openai::OpenAiTextModel;
pub use search::HttpSearchProvider;
pub use sqlite::{SqliteCalendarStore, SqliteConnector, SqliteHistoryStore, SqliteTaskStore};
pub use traits::{
    CalendarStore, Document, Embedder, HistoryStore, KnowledgeIndex, MailMessage, MailSession,
    NewEvent, NewTask, QueryOutput, SearchHit, SearchProvider, StoreConn, TaskRow, TaskStats,
    TaskStore, TextModel,
};
