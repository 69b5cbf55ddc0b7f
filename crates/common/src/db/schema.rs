/// DDL for both tables, in execution order.
pub(super) fn statements(dimension: usize) -> Vec<String> {
    vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_items (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            owner_scope_id TEXT,
            organization_id TEXT,
            payload JSONB NOT NULL,
            sync_flag TEXT NOT NULL DEFAULT 'unsynced',
            last_sync_error TEXT,
            created_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ,
            PRIMARY KEY (kind, id)
        )
        "#
        .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_knowledge_items_owner ON knowledge_items (owner_scope_id)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_knowledge_items_org ON knowledge_items (organization_id)".to_string(),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS item_embeddings (
                kind TEXT NOT NULL,
                item_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                embedding vector({}) NOT NULL,
                model TEXT NOT NULL,
                version TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                generated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (kind, item_id)
            )
            "#,
            dimension
        ),
        "CREATE INDEX IF NOT EXISTS idx_item_embeddings_scope ON item_embeddings (kind, scope_id)".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_dimension_in_ddl() {
        let stmts = statements(1536);
        assert!(stmts[0].contains("vector"));
        assert!(stmts.iter().any(|s| s.contains("vector(1536)")));
        assert!(stmts.iter().any(|s| s.contains("'{}'::jsonb")));
    }
}
