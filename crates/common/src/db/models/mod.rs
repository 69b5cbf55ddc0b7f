//! SeaORM entity models

mod knowledge_item;

pub use knowledge_item::{
    ActiveModel as KnowledgeItemActiveModel, Column as KnowledgeItemColumn,
    Entity as KnowledgeItemEntity, Model as KnowledgeItemRow,
};
