//! End-to-end scenarios across supervisor, engine workers and bindings.

mod common;

use anyhow::Result;
use common::{PATIENCE, TestTree};
use tokio::time::timeout;
use vatvisor_kernel::driver::DriverError;
use vatvisor_kernel::message::{Headers, Id, Message, MessageType};

#[tokio::test]
async fn evaluate_request_from_driver_is_answered_ok() -> Result<()> {
    let tree = TestTree::start()?;
    let vat = tree.spawn_engine(Id::SUPERVISOR);

    let (request, reply) = Message::request(
        Headers::new(MessageType::System)
            .with_from(Id::DRIVER)
            .with_to(vat),
    );
    let body = serde_json::json!({ "method": "evaluate", "source": "1+1" }).to_string();
    tree.supervisor.deliver(request.with_body(body))?;

    let reply = timeout(PATIENCE, reply).await??;
    assert_eq!(reply.headers.kind, MessageType::Ok);
    assert_eq!(reply.headers.to, Id::DRIVER);
    assert!(reply.body.is_empty());

    tree.stop().await
}

#[tokio::test]
async fn driver_runs_entry_point_then_shuts_down() -> Result<()> {
    let tree = TestTree::start()?;
    let bindings = tree.spawn_bindings(Id::SUPERVISOR);
    let vat = tree.spawn_engine(bindings);

    let reply = timeout(PATIENCE, tree.driver.evaluate(vat, "1+1")).await??;
    assert_eq!(reply.headers.kind, MessageType::Ok);
    let reply = timeout(PATIENCE, tree.driver.import(vat, "./main.js")).await??;
    assert_eq!(reply.headers.kind, MessageType::Ok);

    timeout(PATIENCE, tree.driver.shutdown()).await?;
    assert!(tree.supervisor.is_stopped());
    Ok(())
}

#[tokio::test]
async fn stop_resolves_wait_with_workers_in_flight() -> Result<()> {
    let tree = TestTree::start()?;
    let bindings = tree.spawn_bindings(Id::SUPERVISOR);
    let vats: Vec<Id> = (0..4).map(|_| tree.spawn_engine(bindings)).collect();
    let (recorder, _seen) = tree.spawn_recorder(Id::SUPERVISOR);

    let mut pending = Vec::new();
    for &vat in &vats {
        let (request, reply) = Message::request(
            Headers::new(MessageType::System)
                .with_from(Id::DRIVER)
                .with_to(vat),
        );
        tree.supervisor.deliver(request.with_body("call"))?;
        pending.push(reply);
        tree.supervisor.deliver(
            Message::new(
                Headers::new(MessageType::Send)
                    .with_from(vat)
                    .with_to(recorder),
            )
            .with_body("noise"),
        )?;
    }

    tree.supervisor.stop();
    timeout(PATIENCE, tree.supervisor.wait()).await?;
    assert!(tree.supervisor.is_stopped());

    // Every request either completed or had its reply channel dropped.
    for reply in pending {
        let _ = timeout(PATIENCE, reply).await?;
    }
    Ok(())
}

#[tokio::test]
async fn reentrant_command_resolves_before_the_outer_reply() -> Result<()> {
    let tree = TestTree::start()?;
    let bindings = tree.spawn_bindings(Id::SUPERVISOR);
    assert_eq!(bindings, Id::new(1));
    let vat = tree.spawn_engine(bindings);

    // Unrelated traffic keeps the routing task busy during the nested call.
    let (left, _left_seen) = tree.spawn_recorder(Id::SUPERVISOR);
    let (right, mut right_seen) = tree.spawn_recorder(Id::SUPERVISOR);
    let chatter = {
        let supervisor = tree.supervisor.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                let message = Message::new(
                    Headers::new(MessageType::Send)
                        .with_from(left)
                        .with_to(right),
                )
                .with_body(format!("{i}"));
                if supervisor.deliver(message).is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let reply = timeout(PATIENCE, tree.driver.request(vat, "call")).await??;
    assert_eq!(reply.headers.kind, MessageType::Ok);
    assert_eq!(reply.headers.from, vat);
    let location = String::from_utf8(reply.body.to_vec())?;
    assert!(location.starts_with("file://"), "got {location}");
    assert!(location.ends_with('/'));

    timeout(PATIENCE, chatter).await??;
    let mut received = 0;
    while received < 200 {
        let message = timeout(PATIENCE, right_seen.recv()).await?.expect("recorder alive");
        assert_eq!(message.headers.from, left);
        received += 1;
    }

    tree.stop().await
}

#[tokio::test]
async fn reentrant_command_to_non_ancestor_is_refused() -> Result<()> {
    let tree = TestTree::start()?;
    // Worker 1 is a sibling of the engine here, not its ancestor.
    let (sibling, _seen) = tree.spawn_recorder(Id::SUPERVISOR);
    assert_eq!(sibling, Id::new(1));
    let vat = tree.spawn_engine(Id::SUPERVISOR);

    let err = timeout(PATIENCE, tree.driver.request(vat, "call"))
        .await?
        .unwrap_err();
    assert!(
        matches!(&err, DriverError::Rejected(text) if text == "can only sync system call parent or ancestor vats"),
        "got {err}"
    );

    tree.stop().await
}
