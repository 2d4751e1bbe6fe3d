use anyhow::{anyhow, Context, Result};
use chrono::SecondsFormat;
use rusqlite::{params, Connection, Row, ToSql};

use crate::db::{
    helpers::{parse_body, parse_datetime},
    Database,
};
use crate::models::{ContentKind, Item, Query};

const ITEM_COLUMNS: &str = "i.kind, i.id, i.title, i.summary, i.body, i.published_at, i.updated_at";

fn format_timestamp(value: &chrono::DateTime<chrono::Utc>) -> String {
    // Fixed-width UTC timestamps keep lexical order equal to time order.
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_item(row: &Row) -> Result<Item> {
    let kind: String = row.get("kind")?;
    let body: String = row.get("body")?;
    let published_at: String = row.get("published_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Item {
        id: row.get("id")?,
        kind: ContentKind::parse(&kind)?,
        title: row.get("title")?,
        summary: row.get("summary")?,
        tags: Vec::new(),
        categories: Vec::new(),
        body: parse_body(&body)?,
        published_at: parse_datetime(&published_at, "published_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn load_descriptors(conn: &Connection, item: &mut Item) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT tag FROM item_tags WHERE kind = ?1 AND item_id = ?2 ORDER BY tag ASC",
    )?;
    let tags = stmt
        .query_map(params![item.kind.as_str(), item.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT category FROM item_categories WHERE kind = ?1 AND item_id = ?2 ORDER BY category ASC",
    )?;
    let categories = stmt
        .query_map(params![item.kind.as_str(), item.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    item.tags = tags;
    item.categories = categories;
    Ok(())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Local read for one page. Mirrors the server's paging: newest first, then
/// by id, filtered by descriptors and publication date.
fn select_page(conn: &Connection, query: &Query) -> Result<Vec<Item>> {
    let mut clauses = vec!["i.kind = ?".to_string()];
    let mut params_vec: Vec<Box<dyn ToSql>> = vec![Box::new(query.kind.as_str())];

    let tags = &query.content_filter.tags;
    if !tags.is_empty() {
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM item_tags t WHERE t.kind = i.kind AND t.item_id = i.id AND t.tag IN ({}))",
            placeholders(tags.len())
        ));
        params_vec.extend(tags.iter().map(|tag| Box::new(tag.clone()) as Box<dyn ToSql>));
    }

    let categories = &query.content_filter.categories;
    if !categories.is_empty() {
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM item_categories c WHERE c.kind = i.kind AND c.item_id = i.id AND c.category IN ({}))",
            placeholders(categories.len())
        ));
        params_vec.extend(
            categories
                .iter()
                .map(|category| Box::new(category.clone()) as Box<dyn ToSql>),
        );
    }

    if let Some(temporal) = query.temporal_filter {
        clauses.push("i.published_year = ?".to_string());
        params_vec.push(Box::new(temporal.year));
        if let Some(month) = temporal.month {
            clauses.push("i.published_month = ?".to_string());
            params_vec.push(Box::new(month));
        }
    }

    params_vec.push(Box::new(query.limit));
    params_vec.push(Box::new(query.offset));

    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM items i WHERE {} ORDER BY i.published_at DESC, i.id ASC LIMIT ? OFFSET ?",
        clauses.join(" AND ")
    );

    let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_refs.as_slice())?;

    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(row_to_item(row)?);
    }
    for item in items.iter_mut() {
        load_descriptors(conn, item)?;
    }

    Ok(items)
}

impl Database {
    pub async fn query_items(&self, query: &Query) -> Result<Vec<Item>> {
        let query = query.clone();
        self.execute(move |conn| {
            select_page(conn, &query).with_context(|| format!("failed to read page {query}"))
        })
        .await
    }

    pub async fn get_item(&self, kind: ContentKind, id: &str) -> Result<Option<Item>> {
        let id = id.to_string();
        self.execute(move |conn| {
            let sql = format!("SELECT {ITEM_COLUMNS} FROM items i WHERE i.kind = ?1 AND i.id = ?2");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![kind.as_str(), id])?;
            let mut item = match rows.next()? {
                Some(row) => row_to_item(row)?,
                None => return Ok(None),
            };
            drop(rows);
            load_descriptors(conn, &mut item)?;
            Ok(Some(item))
        })
        .await
    }

    /// Insert or replace items, descriptors included, in one transaction.
    pub async fn upsert_items(&self, items: Vec<Item>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        self.execute_write(move |conn| {
            let tx = conn.transaction().context("failed to open upsert transaction")?;
            for item in &items {
                let body = serde_json::to_string(&item.body)?;
                tx.execute(
                    "INSERT INTO items (kind, id, title, summary, body, published_at, published_year, published_month, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (kind, id) DO UPDATE SET
                         title = excluded.title,
                         summary = excluded.summary,
                         body = excluded.body,
                         published_at = excluded.published_at,
                         published_year = excluded.published_year,
                         published_month = excluded.published_month,
                         updated_at = excluded.updated_at",
                    params![
                        item.kind.as_str(),
                        item.id,
                        item.title,
                        item.summary,
                        body,
                        format_timestamp(&item.published_at),
                        item.published_year(),
                        item.published_month(),
                        format_timestamp(&item.updated_at),
                    ],
                )
                .with_context(|| format!("failed to upsert item {}", item.id))?;

                tx.execute(
                    "DELETE FROM item_tags WHERE kind = ?1 AND item_id = ?2",
                    params![item.kind.as_str(), item.id],
                )?;
                for tag in &item.tags {
                    tx.execute(
                        "INSERT OR IGNORE INTO item_tags (kind, item_id, tag) VALUES (?1, ?2, ?3)",
                        params![item.kind.as_str(), item.id, tag],
                    )?;
                }

                tx.execute(
                    "DELETE FROM item_categories WHERE kind = ?1 AND item_id = ?2",
                    params![item.kind.as_str(), item.id],
                )?;
                for category in &item.categories {
                    tx.execute(
                        "INSERT OR IGNORE INTO item_categories (kind, item_id, category) VALUES (?1, ?2, ?3)",
                        params![item.kind.as_str(), item.id, category],
                    )?;
                }
            }
            tx.commit().context("failed to commit item upsert")?;
            Ok(())
        })
        .await
    }

    /// Delete items by id. Unknown ids are ignored.
    pub async fn delete_items(&self, kind: ContentKind, ids: Vec<String>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.execute_write(move |conn| {
            let tx = conn.transaction().context("failed to open delete transaction")?;
            let mut removed = 0;
            for id in &ids {
                removed += tx.execute(
                    "DELETE FROM items WHERE kind = ?1 AND id = ?2",
                    params![kind.as_str(), id],
                )?;
            }
            tx.commit().context("failed to commit item delete")?;
            Ok(removed)
        })
        .await
    }

    pub async fn count_items(&self, kind: ContentKind) -> Result<usize> {
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM items WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )?;
            usize::try_from(count).map_err(|_| anyhow!("negative item count {count}"))
        })
        .await
    }
}
