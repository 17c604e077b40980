//! `sessiongrid demo`: one session taken through its whole life against the
//! in-memory store, reporting the principal index after every step.

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use sg_domain::config::Config;
use sg_sessions::{
    AttributeIndexResolver, MemoryIndexManager, MemorySessionStore, RequestContext,
    SessionRepository, SessionRepositoryBuilder, PRINCIPAL_NAME_INDEX,
};

/// Attribute the principal index is resolved from unless the config
/// declares its own `principal` index.
const PRINCIPAL_ATTRIBUTE: &str = "principal_name";

pub fn run(config: &Config, principal: &str, as_json: bool) -> anyhow::Result<()> {
    let store = Arc::new(MemorySessionStore::new());
    let repo = build_repository(config, store.clone())?;
    let attribute = principal_attribute(config);
    tracing::debug!(principal, attribute = %attribute, "running session demo");
    let mut steps = Vec::new();
    let mut ctx = RequestContext::new();

    let session = repo.create().context("creating session")?;
    let first_id = session.id();
    session
        .set_attribute(&attribute, principal)
        .context("setting principal")?;
    repo.save(&mut ctx, &session);
    steps.push(step("created", &repo, principal));

    let found = repo
        .find(&mut ctx, &first_id)
        .context("session vanished after save")?;
    found
        .set_attribute("cart", json!({ "items": 2 }))
        .context("setting cart")?;
    let second_id = found.change_id().context("changing session id")?;
    repo.save(&mut ctx, &found);
    steps.push(step("id changed", &repo, principal));

    let deleted = repo.delete(&mut ctx, &second_id);
    steps.push(step("deleted", &repo, principal));

    let report = json!({
        "principal": principal,
        "first_id": first_id.to_string(),
        "second_id": second_id.to_string(),
        "deleted": deleted,
        "commits": store.stats().commits(),
        "rollbacks": store.stats().rollbacks(),
        "steps": steps,
    });

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("principal {principal}");
        println!("  session {first_id} -> {second_id}");
        for s in &steps {
            println!("  {:<12} indexed sessions: {}", s["step"].as_str().unwrap_or(""), s["sessions"]);
        }
        println!(
            "  commits {}, rollbacks {}, deleted {deleted}",
            store.stats().commits(),
            store.stats().rollbacks()
        );
    }
    Ok(())
}

/// Repository over `store` with an in-memory manager for every configured
/// index plus the principal index.
fn build_repository(
    config: &Config,
    store: Arc<MemorySessionStore>,
) -> anyhow::Result<SessionRepository> {
    let mut builder = SessionRepositoryBuilder::new(store).with_config(&config.sessions);
    for index in &config.sessions.indexes {
        builder = builder.index_manager(index.name.clone(), Arc::new(MemoryIndexManager::new()));
    }
    if !has_principal_index(config) {
        builder = builder
            .resolver(Arc::new(AttributeIndexResolver::new(
                PRINCIPAL_NAME_INDEX,
                PRINCIPAL_ATTRIBUTE,
            )))
            .index_manager(PRINCIPAL_NAME_INDEX, Arc::new(MemoryIndexManager::new()));
    }
    builder.build().context("building session repository")
}

fn has_principal_index(config: &Config) -> bool {
    config
        .sessions
        .indexes
        .iter()
        .any(|i| i.name == PRINCIPAL_NAME_INDEX)
}

fn principal_attribute(config: &Config) -> String {
    config
        .sessions
        .indexes
        .iter()
        .find(|i| i.name == PRINCIPAL_NAME_INDEX)
        .map(|i| i.attribute.clone())
        .unwrap_or_else(|| PRINCIPAL_ATTRIBUTE.to_owned())
}

fn step(name: &str, repo: &SessionRepository, principal: &str) -> serde_json::Value {
    let sessions: Vec<String> = repo
        .find_by_principal_name(principal)
        .into_keys()
        .map(|id| id.to_string())
        .collect();
    json!({ "step": name, "sessions": sessions })
}
