// ABOUTME: Administrative statement rendering for subscriptions and replication origins
// ABOUTME: All identifiers and literals are quoted here; nothing else builds SQL by hand

use crate::replication::spec::SubscriptionSpec;

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn publication_list<'a, I>(publications: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    publications
        .into_iter()
        .map(|p| quote_ident(p))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn create_subscription(spec: &SubscriptionSpec) -> String {
    let mut options = vec![
        format!("enabled = {}", spec.enabled),
        format!("connect = {}", spec.connect),
        format!("copy_data = {}", spec.copy_data),
        format!("create_slot = {}", spec.create_slot),
    ];
    if let Some(slot) = &spec.slot_name {
        options.push(format!("slot_name = {}", quote_literal(slot)));
    }

    format!(
        "CREATE SUBSCRIPTION {} CONNECTION {} PUBLICATION {} WITH ({})",
        quote_ident(&spec.name),
        quote_literal(&spec.conninfo),
        publication_list(&spec.publications),
        options.join(", ")
    )
}

pub fn enable_subscription(name: &str) -> String {
    format!("ALTER SUBSCRIPTION {} ENABLE", quote_ident(name))
}

pub fn disable_subscription(name: &str) -> String {
    format!("ALTER SUBSCRIPTION {} DISABLE", quote_ident(name))
}

/// The server only refreshes table membership for enabled subscriptions; a disabled one
/// must be altered with `refresh = false`.
pub fn set_publications<'a, I>(name: &str, publications: I, refresh: bool) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let mut statement = format!(
        "ALTER SUBSCRIPTION {} SET PUBLICATION {}",
        quote_ident(name),
        publication_list(publications)
    );
    if !refresh {
        statement.push_str(" WITH (refresh = false)");
    }
    statement
}

pub fn set_connection(name: &str, conninfo: &str) -> String {
    format!(
        "ALTER SUBSCRIPTION {} CONNECTION {}",
        quote_ident(name),
        quote_literal(conninfo)
    )
}

/// `None` detaches the subscription from its slot.
pub fn set_slot_name(name: &str, slot: Option<&str>) -> String {
    let value = match slot {
        Some(slot) => quote_literal(slot),
        None => "NONE".to_string(),
    };
    format!(
        "ALTER SUBSCRIPTION {} SET (slot_name = {})",
        quote_ident(name),
        value
    )
}

pub fn drop_subscription(name: &str) -> String {
    format!("DROP SUBSCRIPTION {}", quote_ident(name))
}

pub const SELECT_STATE: &str = "\
SELECT s.oid, s.subenabled, s.subslotname::text, s.subconninfo, s.subpublications, \
       os.remote_lsn::text \
FROM pg_catalog.pg_subscription s \
JOIN pg_catalog.pg_database d ON d.oid = s.subdbid \
LEFT JOIN pg_catalog.pg_replication_origin_status os ON os.external_id = 'pg_' || s.oid::text \
WHERE s.subname = $1 AND d.datname = pg_catalog.current_database()";

pub const SELECT_ORIGIN_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_replication_origin WHERE roname = $1)";

pub const SELECT_SUBSCRIPTION_ORIGINS: &str =
    "SELECT roname FROM pg_catalog.pg_replication_origin WHERE roname ~ '^pg_[0-9]+(_[0-9]+)?$' ORDER BY roname";

pub const SELECT_SUBSCRIPTION_OIDS: &str = "SELECT oid FROM pg_catalog.pg_subscription";

pub const ORIGIN_PROGRESS: &str =
    "SELECT pg_catalog.pg_replication_origin_progress($1, true)::text";

pub const DROP_ORIGIN: &str = "SELECT pg_catalog.pg_replication_origin_drop($1)";

pub const ADVANCE_ORIGIN: &str =
    "SELECT pg_catalog.pg_replication_origin_advance($1, $2::text::pg_lsn)";
