//! Initial buffer size resolution from the environment through to a live
//! engine instance.

mod common;

use std::collections::HashMap;

use anyhow::Result;
use common::{engine_module, TestTree};
use vatvisor_kernel::engine::WasmEngine;
use vatvisor_kernel::infrastructure::config::{
    BufferLimits, DebugSettings, Settings, DEFAULT_INITIAL_BUFFER_SIZE, DEFAULT_MAX_BUFFER_SIZE,
};
use vatvisor_kernel::message::Id;

async fn engine_for(tree: &TestTree, initial_size: Option<&str>) -> Result<WasmEngine> {
    let mut vars = HashMap::new();
    if let Some(raw) = initial_size {
        vars.insert("VATVISOR__BUFFER__INITIAL_SIZE".to_owned(), raw.to_owned());
    }
    let settings = Settings::from_vars(vars)?;
    let limits = BufferLimits::from_settings(&settings.buffer);
    let issuer = tree.spawn_issuer(Id::SUPERVISOR).await?;
    Ok(engine_module()?
        .instantiate(issuer, limits, DebugSettings::default())
        .await?)
}

#[tokio::test]
async fn unset_initial_size_uses_default() -> Result<()> {
    let tree = TestTree::start()?;
    let engine = engine_for(&tree, None).await?;
    assert_eq!(engine.buffer_size(), DEFAULT_INITIAL_BUFFER_SIZE);
    tree.stop().await
}

#[tokio::test]
async fn oversized_initial_size_is_clamped_to_maximum() -> Result<()> {
    let tree = TestTree::start()?;
    let engine = engine_for(&tree, Some("8388608")).await?;
    assert_eq!(engine.buffer_size(), DEFAULT_MAX_BUFFER_SIZE);
    tree.stop().await
}

#[tokio::test]
async fn non_numeric_initial_size_uses_default() -> Result<()> {
    let tree = TestTree::start()?;
    let engine = engine_for(&tree, Some("abc")).await?;
    assert_eq!(engine.buffer_size(), DEFAULT_INITIAL_BUFFER_SIZE);
    tree.stop().await
}

#[tokio::test]
async fn numeric_initial_size_is_applied() -> Result<()> {
    let tree = TestTree::start()?;
    let engine = engine_for(&tree, Some("262144")).await?;
    assert_eq!(engine.buffer_size(), 262_144);
    tree.stop().await
}
