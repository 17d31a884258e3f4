//! Font face metadata persisted by the subtitle catalog, unique on full name.

use crate::db::Database;
use crate::error::Result;

#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct FontMeta {
    pub family: String,
    pub full_name: String,
    pub postscript_name: String,
    pub family_zh: String,
    pub full_name_zh: String,
    pub path: String,
    pub face_index: i64,
    pub weight: i64,
    pub italic: bool,
    pub kind: String,
}

#[derive(Clone)]
pub struct FontRepository {
    pool: Database,
}

impl FontRepository {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    pub async fn save(&self, meta: &FontMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fonts
                (family, full_name, postscript_name, family_zh, full_name_zh,
                 path, face_index, weight, italic, kind)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(full_name) DO UPDATE SET
                family = excluded.family,
                postscript_name = excluded.postscript_name,
                family_zh = excluded.family_zh,
                full_name_zh = excluded.full_name_zh,
                path = excluded.path,
                face_index = excluded.face_index,
                weight = excluded.weight,
                italic = excluded.italic,
                kind = excluded.kind
            "#,
        )
        .bind(&meta.family)
        .bind(&meta.full_name)
        .bind(&meta.postscript_name)
        .bind(&meta.family_zh)
        .bind(&meta.full_name_zh)
        .bind(&meta.path)
        .bind(meta.face_index)
        .bind(meta.weight)
        .bind(meta.italic)
        .bind(&meta.kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<FontMeta>> {
        let rows = sqlx::query_as::<_, FontMeta>("SELECT * FROM fonts ORDER BY full_name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fonts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM fonts").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_is_unique_on_full_name() {
        let pool = crate::db::open_test_db().await;
        let repo = FontRepository::new(pool);
        let mut meta = FontMeta {
            family: "Source Han Sans".to_string(),
            full_name: "Source Han Sans Regular".to_string(),
            path: "/data/fonts/SourceHanSans.ttc".to_string(),
            weight: 400,
            kind: "ttf".to_string(),
            ..Default::default()
        };
        repo.save(&meta).await.unwrap();
        meta.weight = 500;
        repo.save(&meta).await.unwrap();

        let fonts = repo.list().await.unwrap();
        assert_eq!(fonts.len(), 1);
        assert_eq!(fonts[0].weight, 500);
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
