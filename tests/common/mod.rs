// ABOUTME: Shared fixtures for integration tests against a live PostgreSQL cluster
// ABOUTME: Builds a publisher and a subscriber database pair with a pre-created slot

#![allow(dead_code)]

use std::time::Duration;

use pg_subscription_lifecycle::convergence::PollPolicy;
use pg_subscription_lifecycle::{
    Gateway, Lsn, OriginReconciler, SubscriptionController, SubscriptionError, SubscriptionSpec,
};
use rand::Rng;

pub const SCHEMA: &str = "pub_schema";
pub const TABLE: &str = "test_table";
pub const PUBLICATION: &str = "test_pub";

/// Superuser URL for a cluster running with `wal_level = logical`.
pub fn test_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to a superuser URL on a wal_level=logical cluster")
}

/// Replace the database component of a URL, keeping any query string.
pub fn with_database(url: &str, database: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };
    let authority_start = base.find("://").map(|i| i + 3).unwrap_or(0);
    let path_start = base[authority_start..]
        .find('/')
        .map(|i| authority_start + i)
        .unwrap_or(base.len());
    let mut out = format!("{}/{}", &base[..path_start], database);
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}

pub fn poll_policy() -> PollPolicy {
    PollPolicy::fixed(Duration::from_secs(60), Duration::from_millis(500))
}

pub struct Fixture {
    pub url: String,
    pub gateway: Gateway,
    pub controller: SubscriptionController,
    pub origins: OriginReconciler,
    pub pub_db: String,
    pub sub_db: String,
    pub name: String,
}

impl Fixture {
    pub async fn new() -> Self {
        let url = test_url();
        let gateway = Gateway::from_url(&url).expect("valid TEST_DATABASE_URL");
        let suffix: u32 = rand::thread_rng().gen_range(100_000..999_999);

        let fixture = Self {
            controller: SubscriptionController::new(gateway.clone()),
            origins: OriginReconciler::new(gateway.clone()),
            pub_db: format!("pgsub_pub_{}", suffix),
            sub_db: format!("pgsub_sub_{}", suffix),
            name: format!("test_slot_{}", suffix),
            gateway,
            url,
        };

        let admin = fixture.gateway.session("postgres").await.expect("admin session");
        for db in [&fixture.pub_db, &fixture.sub_db] {
            admin
                .execute(&format!("CREATE DATABASE {}", db))
                .await
                .expect("create test database");
            let session = fixture.gateway.session(db).await.expect("test db session");
            session
                .execute(&format!(
                    "CREATE SCHEMA {SCHEMA}; \
                     CREATE TABLE {SCHEMA}.{TABLE} (\
                        id SERIAL PRIMARY KEY, \
                        data TEXT, \
                        created_at TIMESTAMP DEFAULT NOW())"
                ))
                .await
                .expect("create test table");
        }

        let publisher = fixture.gateway.session(&fixture.pub_db).await.expect("publisher session");
        publisher
            .execute(&format!(
                "CREATE PUBLICATION {PUBLICATION} FOR TABLE {SCHEMA}.{TABLE}"
            ))
            .await
            .expect("create publication");
        publisher
            .client()
            .query_one(
                "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
                &[&fixture.name],
            )
            .await
            .expect("create replication slot");

        fixture
    }

    /// A disabled subscription on the pre-created slot, without initial copy.
    pub fn disabled_spec(&self) -> SubscriptionSpec {
        let mut spec = SubscriptionSpec::new(
            &self.name,
            &self.sub_db,
            &with_database(&self.url, &self.pub_db),
            [PUBLICATION],
        );
        spec.enabled = false;
        spec.create_slot = false;
        spec.slot_name = Some(self.name.clone());
        spec.copy_data = false;
        spec.connect = true;
        spec
    }

    pub async fn insert_row(&self, value: &str) {
        let session = self.gateway.session(&self.pub_db).await.expect("publisher session");
        session
            .client()
            .execute(
                format!("INSERT INTO {SCHEMA}.{TABLE} (data) VALUES ($1)").as_str(),
                &[&value],
            )
            .await
            .expect("insert row");
    }

    pub async fn current_lsn(&self) -> Lsn {
        let session = self.gateway.session(&self.pub_db).await.expect("publisher session");
        let row = session
            .client()
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await
            .expect("current lsn");
        let text: String = row.get(0);
        text.parse().expect("server LSN parses")
    }

    pub async fn subscription_oid(&self) -> u32 {
        self.controller
            .read(&self.sub_db, &self.name)
            .await
            .expect("read subscription")
            .oid
            .expect("subscription exists")
    }

    /// Origins named after subscription `oid`, including table-sync ones, straight from the
    /// shared catalog.
    pub async fn origins_of(&self, oid: u32) -> Result<Vec<String>, SubscriptionError> {
        let session = self.gateway.session("postgres").await?;
        let apply_origin = format!("pg_{}", oid);
        let sync_pattern = format!("pg\\_{}\\_%", oid);
        let rows = session
            .client()
            .query(
                "SELECT roname FROM pg_catalog.pg_replication_origin \
                 WHERE roname = $1 OR roname LIKE $2 ORDER BY roname",
                &[&apply_origin, &sync_pattern],
            )
            .await
            .map_err(|e| SubscriptionError::from_db(&e))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub async fn drop_origin(&self, origin: &str) {
        let session = self.gateway.session("postgres").await.expect("admin session");
        session
            .client()
            .query_one("SELECT pg_replication_origin_drop($1)", &[&origin])
            .await
            .expect("drop origin");
    }

    pub async fn origin_progress(&self, origin: &str) -> Option<Lsn> {
        let session = self.gateway.session("postgres").await.expect("admin session");
        let row = session
            .client()
            .query_one(
                "SELECT pg_replication_origin_progress($1, true)::text",
                &[&origin],
            )
            .await
            .expect("origin progress");
        let text: Option<String> = row.get(0);
        text.map(|t| t.parse().expect("server LSN parses"))
    }

    /// Drop the fixture's slot on the publisher, retrying while a walsender still holds it.
    pub async fn drop_publisher_slot(&self) {
        let gateway = &self.gateway;
        let (pub_db, slot) = (self.pub_db.as_str(), self.name.as_str());
        pg_subscription_lifecycle::wait_until(&poll_policy(), || async move {
            let session = gateway.session(pub_db).await?;
            session
                .client()
                .query_one("SELECT pg_drop_replication_slot($1)", &[&slot])
                .await
                .map(|_| true)
                .map_err(|e| SubscriptionError::from_db(&e))
        })
        .await
        .expect("publisher slot dropped");
    }

    pub async fn teardown(self) {
        let _ = self
            .controller
            .drop_subscription(&self.name, &self.sub_db, true)
            .await;
        if let Ok(publisher) = self.gateway.session(&self.pub_db).await {
            let _ = publisher
                .client()
                .execute(
                    "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1",
                    &[&self.name],
                )
                .await;
        }
        let _ = self.origins.sweep_orphans("postgres").await;
        if let Ok(admin) = self.gateway.session("postgres").await {
            for db in [&self.pub_db, &self.sub_db] {
                let _ = admin
                    .execute(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", db))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_database_swaps_path() {
        assert_eq!(
            with_database("postgresql://u:p@localhost:5432/postgres?sslmode=disable", "pub"),
            "postgresql://u:p@localhost:5432/pub?sslmode=disable"
        );
        assert_eq!(
            with_database("postgresql://localhost", "pub"),
            "postgresql://localhost/pub"
        );
    }
}
