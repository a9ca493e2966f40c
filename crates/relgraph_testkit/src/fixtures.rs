//! Test fixtures and channel helpers.
//!
//! Provides the gallery schema used across the integration tests, a
//! channel over a scripted driver, and helpers that fetch committed
//! objects into a context the way a real query would.

use relgraph_codec::{Identity, Value};
use relgraph_core::query::{Property, SelectQuery};
use relgraph_core::{Channel, ChannelConfig, Context, ContextConfig, EntityRef};
use relgraph_driver::{MemoryDriver, Row};
use relgraph_schema::{Attribute, ColumnType, DeleteRule, Entity, Relationship, Schema};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// The gallery schema.
///
/// - `Artist` (`ARTIST`): `id`, `name`, `bio` (CLOB), `version` (locking);
///   `paintings` to-many (cascade), `mentor` to-one onto itself
/// - `Painting` (`PAINTING`): `id`, `title`, `image` (BLOB); `artist` and
///   `gallery` to-one
/// - `Gallery` (`GALLERY`): `id`, `name`; `paintings` to-many (deny),
///   `exhibits` to-many (cascade)
/// - `Exhibit` (`EXHIBIT`): `id`, `number`; `gallery` to-one
pub fn gallery_schema() -> Schema {
    Schema::builder()
        .entity(
            Entity::new("Artist", "ARTIST")
                .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                .attribute(Attribute::new("name", "NAME", ColumnType::VarChar).mandatory())
                .attribute(Attribute::new("bio", "BIO", ColumnType::Clob))
                .attribute(Attribute::new("version", "VERSION", ColumnType::Integer).used_for_locking())
                .relationship(
                    Relationship::to_many("paintings", "Painting")
                        .join("ID", "ARTIST_ID")
                        .reverse("artist")
                        .delete_rule(DeleteRule::Cascade),
                )
                .relationship(Relationship::to_one("mentor", "Artist").join("MENTOR_ID", "ID")),
        )
        .entity(
            Entity::new("Painting", "PAINTING")
                .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                .attribute(Attribute::new("title", "TITLE", ColumnType::VarChar))
                .attribute(Attribute::new("image", "IMAGE", ColumnType::Blob))
                .relationship(
                    Relationship::to_one("artist", "Artist")
                        .join("ARTIST_ID", "ID")
                        .reverse("paintings"),
                )
                .relationship(
                    Relationship::to_one("gallery", "Gallery")
                        .join("GALLERY_ID", "ID")
                        .reverse("paintings"),
                ),
        )
        .entity(
            Entity::new("Gallery", "GALLERY")
                .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                .attribute(Attribute::new("name", "NAME", ColumnType::VarChar))
                .relationship(
                    Relationship::to_many("paintings", "Painting")
                        .join("ID", "GALLERY_ID")
                        .reverse("gallery")
                        .delete_rule(DeleteRule::Deny),
                )
                .relationship(
                    Relationship::to_many("exhibits", "Exhibit")
                        .join("ID", "GALLERY_ID")
                        .reverse("gallery")
                        .delete_rule(DeleteRule::Cascade),
                ),
        )
        .entity(
            Entity::new("Exhibit", "EXHIBIT")
                .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                .attribute(Attribute::new("number", "NUM", ColumnType::Integer))
                .relationship(
                    Relationship::to_one("gallery", "Gallery")
                        .join("GALLERY_ID", "ID")
                        .reverse("exhibits"),
                ),
        )
        .build()
        .expect("gallery schema is valid")
}

/// Writes `schema` as JSON to a temporary file.
pub fn schema_file(schema: &Schema) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    let json = schema.to_json().expect("Failed to serialize schema");
    file.write_all(json.as_bytes()).expect("Failed to write schema");
    file
}

/// Identity of an artist row.
pub fn artist_id(id: i64) -> Identity {
    Identity::single("Artist", "ID", id)
}

/// Identity of a painting row.
pub fn painting_id(id: i64) -> Identity {
    Identity::single("Painting", "ID", id)
}

/// Identity of a gallery row.
pub fn gallery_id(id: i64) -> Identity {
    Identity::single("Gallery", "ID", id)
}

/// A full `ARTIST` row at version 1.
pub fn artist_row(id: i64, name: &str) -> Row {
    Row::new()
        .with("ID", id)
        .with("NAME", name)
        .with("BIO", Value::Null)
        .with("VERSION", 1i64)
        .with("MENTOR_ID", Value::Null)
}

/// A full `PAINTING` row.
pub fn painting_row(id: i64, title: &str, artist: Option<i64>, gallery: Option<i64>) -> Row {
    Row::new()
        .with("ID", id)
        .with("TITLE", title)
        .with("IMAGE", Value::Null)
        .with("ARTIST_ID", artist.map_or(Value::Null, Value::Integer))
        .with("GALLERY_ID", gallery.map_or(Value::Null, Value::Integer))
}

/// A full `GALLERY` row.
pub fn gallery_row(id: i64, name: &str) -> Row {
    Row::new().with("ID", id).with("NAME", name)
}

/// A channel over a [`MemoryDriver`] serving the gallery schema.
pub struct TestChannel {
    /// The scripted driver.
    pub driver: Arc<MemoryDriver>,
    /// The channel shared by contexts created here.
    pub channel: Arc<Channel>,
}

impl TestChannel {
    /// Creates a synchronous channel.
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    /// Creates a channel with the given configuration.
    pub fn with_config(config: ChannelConfig) -> Self {
        let driver = Arc::new(MemoryDriver::new());
        let channel = Channel::new(driver.clone(), Arc::new(gallery_schema()), config)
            .expect("Failed to create channel");
        Self {
            driver,
            channel: Arc::new(channel),
        }
    }

    /// Creates a peer context on the channel.
    pub fn context(&self) -> Context {
        Context::new(Arc::clone(&self.channel))
    }

    /// Creates a peer context with the given configuration.
    pub fn context_with(&self, config: ContextConfig) -> Context {
        Context::with_config(Arc::clone(&self.channel), config)
    }

    /// Fetches one row of `entity` by `id` into `context`.
    ///
    /// The row is scripted on the driver and then read through a real
    /// query, so the object is hydrated exactly as application fetches are.
    pub fn fetch(&self, context: &Context, entity: &str, row: Row) -> EntityRef {
        let id = row.get("ID").cloned().unwrap_or_default();
        self.driver.push_rows(vec![row]);
        let query = SelectQuery::new(entity).filter(Property::new("id").eq(id));
        let mut objects = context.perform_query(&query).expect("Failed to fetch");
        assert_eq!(objects.len(), 1, "expected one {entity}");
        objects.remove(0)
    }

    /// Fetches an artist.
    pub fn fetch_artist(&self, context: &Context, id: i64, name: &str) -> EntityRef {
        self.fetch(context, "Artist", artist_row(id, name))
    }

    /// Fetches a painting.
    pub fn fetch_painting(&self, context: &Context, id: i64, title: &str, artist: Option<i64>) -> EntityRef {
        self.fetch(context, "Painting", painting_row(id, title, artist, None))
    }

    /// Fetches a gallery.
    pub fn fetch_gallery(&self, context: &Context, id: i64, name: &str) -> EntityRef {
        self.fetch(context, "Gallery", gallery_row(id, name))
    }

    /// SQL of every committed statement, in order.
    pub fn committed_sql(&self) -> Vec<String> {
        self.driver.statements().into_iter().map(|s| s.sql).collect()
    }

    /// SQL of committed data-modification statements, in order.
    pub fn committed_writes(&self) -> Vec<String> {
        self.committed_sql()
            .into_iter()
            .filter(|sql| !sql.starts_with("SELECT"))
            .collect()
    }
}

impl Default for TestChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Ready-made object graphs.
pub mod scenarios {
    use super::*;

    /// An artist with `count` paintings, all fetched into `context` and the
    /// artist's `paintings` list resolved.
    pub fn artist_with_paintings(
        store: &TestChannel,
        context: &Context,
        artist: i64,
        count: i64,
    ) -> (EntityRef, Vec<EntityRef>) {
        let owner = store.fetch_artist(context, artist, "Monet");
        let rows: Vec<Row> = (0..count)
            .map(|i| painting_row(artist * 100 + i, &format!("Painting {i}"), Some(artist), None))
            .collect();
        store.driver.push_rows(rows);
        let paintings = context
            .related_objects(&owner, "paintings")
            .expect("Failed to resolve paintings");
        (owner, paintings)
    }
}
