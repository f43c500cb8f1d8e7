use std::time::Duration;

use rconf::codec::{ConfigDelta, FieldRule, FieldTable, Resource, encode_resource};
use rconf::config::Tunables;
use rconf::error::ConfigError;
use rconf::reconcile::{Operation, Phase, ReconcileCtx, Reconciler};
use rconf::session::{
    DISCARD_RPC, LOCK_RPC, ScriptEntry, ScriptedTransport, UNLOCK_RPC, commit_rpc, load_set_rpc,
};

const APPLICATION_READ_FIXTURE: &str = include_str!("fixtures/application_read.jsonl");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Term {
    name: String,
    protocol: Option<String>,
    destination_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Application {
    name: String,
    protocol: Option<String>,
    destination_port: Option<u16>,
    terms: Vec<Term>,
}

impl Resource for Application {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn base_path(&self) -> String {
        format!("applications application {}", self.name)
    }

    fn table() -> FieldTable<Self> {
        FieldTable::new(vec![
            FieldRule::Scalar {
                prefix: "protocol",
                emit: |r| r.protocol.clone(),
                absorb: |r, v| {
                    r.protocol = Some(v.to_string());
                    Ok(())
                },
            },
            FieldRule::Scalar {
                prefix: "destination-port",
                emit: |r| r.destination_port.map(|p| p.to_string()),
                absorb: |r, v| {
                    r.destination_port = Some(v.parse().map_err(|_| format!("bad port '{v}'"))?);
                    Ok(())
                },
            },
            FieldRule::Block {
                prefix: "term",
                emit: |r| {
                    r.terms
                        .iter()
                        .map(|t| {
                            let mut lines = Vec::new();
                            if let Some(protocol) = &t.protocol {
                                lines.push(format!("protocol {protocol}"));
                            }
                            if let Some(port) = t.destination_port {
                                lines.push(format!("destination-port {port}"));
                            }
                            (t.name.clone(), lines)
                        })
                        .collect()
                },
                open: |r, key| {
                    r.terms.push(Term {
                        name: key.to_string(),
                        ..Default::default()
                    })
                },
                absorb: |r, sub| {
                    let term = r
                        .terms
                        .last_mut()
                        .ok_or_else(|| "term field before any term".to_string())?;
                    if let Some(v) = sub.strip_prefix("protocol ") {
                        term.protocol = Some(v.to_string());
                        return Ok(());
                    }
                    if let Some(v) = sub.strip_prefix("destination-port ") {
                        term.destination_port =
                            Some(v.parse().map_err(|_| format!("bad port '{v}'"))?);
                        return Ok(());
                    }
                    Err(format!("unknown term field '{sub}'"))
                },
            },
        ])
    }

    fn skeleton(&self) -> Self {
        Self {
            name: self.name.clone(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.is_some() && !self.terms.is_empty() {
            return Err(ConfigError::Validation {
                entity: self.key(),
                reason: "top-level protocol and terms are mutually exclusive".to_string(),
            });
        }
        Ok(())
    }
}

fn simple_app(name: &str, port: u16) -> Application {
    Application {
        name: name.to_string(),
        protocol: Some("tcp".to_string()),
        destination_port: Some(port),
        terms: Vec::new(),
    }
}

fn show_cmd(app: &Application) -> String {
    format!(
        "show configuration {} | display set relative",
        app.base_path()
    )
}

fn empty_reply() -> &'static str {
    "<output>\n</output>"
}

fn dump_reply(app: &Application) -> String {
    let delta = encode_resource(app).expect("encode for dump");
    format!(
        "<output>{}</output>",
        rconf::codec::relativize(&delta, &app.base_path())
    )
}

#[tokio::test]
async fn create_locks_applies_commits_verifies_and_unlocks_once() {
    let desired = simple_app("api-gw", 8443);
    let delta = encode_resource(&desired).expect("encode");
    let mut transport = ScriptedTransport::new(vec![
        ScriptEntry::ok(show_cmd(&desired), empty_reply()),
        ScriptEntry::ok(LOCK_RPC, "<ok/>"),
        ScriptEntry::ok(load_set_rpc(&delta.to_text()), "<ok/>"),
        ScriptEntry::ok(commit_rpc("create api-gw"), "<ok/>"),
        ScriptEntry::ok(show_cmd(&desired), dump_reply(&desired)),
        ScriptEntry::ok(UNLOCK_RPC, "<ok/>"),
    ]);
    let ctx = ReconcileCtx::new(Tunables::immediate());

    let warnings = Reconciler::new(&mut transport, &ctx)
        .create(&desired)
        .await
        .expect("create succeeds");

    assert!(warnings.is_empty());
    assert!(transport.is_exhausted());
    // Lock discipline: exactly one lock, exactly one unlock, lock ahead
    // of the load and the unlock dead last.
    let requests = transport.requests_seen();
    assert_eq!(requests.iter().filter(|r| **r == LOCK_RPC).count(), 1);
    assert_eq!(requests.iter().filter(|r| **r == UNLOCK_RPC).count(), 1);
    assert_eq!(requests.last(), Some(&UNLOCK_RPC));
}

#[tokio::test]
async fn create_surfaces_commit_warnings_without_failing() {
    let desired = simple_app("api-gw", 8443);
    let delta = encode_resource(&desired).expect("encode");
    let warning_reply = "<rpc-error><error-severity>warning</error-severity>\
        <error-message>uncommitted changes will be discarded on exit</error-message></rpc-error>";
    let mut transport = ScriptedTransport::new(vec![
        ScriptEntry::ok(show_cmd(&desired), empty_reply()),
        ScriptEntry::ok(LOCK_RPC, "<ok/>"),
        ScriptEntry::ok(load_set_rpc(&delta.to_text()), "<ok/>"),
        ScriptEntry::ok(commit_rpc("create api-gw"), warning_reply),
        ScriptEntry::ok(show_cmd(&desired), dump_reply(&desired)),
        ScriptEntry::ok(UNLOCK_RPC, "<ok/>"),
    ]);
    let ctx = ReconcileCtx::new(Tunables::immediate());

    let warnings = Reconciler::new(&mut transport, &ctx)
        .create(&desired)
        .await
        .expect("warnings are non-fatal");

    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("discarded on exit"));
}

#[tokio::test]
async fn commit_failure_rolls_back_exactly_once_and_keeps_the_cause() {
    let desired = simple_app("api-gw", 9443);
    let live = simple_app("api-gw", 8443);
    let encoded = encode_resource(&desired).expect("encode");
    let mut delta = ConfigDelta::new();
    delta.delete(&desired.base_path());
    delta.extend(encoded);

    let commit_rejected = "<rpc-error><error-severity>error</error-severity>\
        <error-message>commit failed: configuration check-out failed</error-message></rpc-error>";
    let mut transport = ScriptedTransport::new(vec![
        ScriptEntry::ok(show_cmd(&desired), dump_reply(&live)),
        ScriptEntry::ok(LOCK_RPC, "<ok/>"),
        ScriptEntry::ok(load_set_rpc(&delta.to_text()), "<ok/>"),
        ScriptEntry::ok(commit_rpc("update api-gw"), commit_rejected),
        ScriptEntry::ok(DISCARD_RPC, "<ok/>"),
        ScriptEntry::ok(UNLOCK_RPC, "<ok/>"),
    ]);
    let ctx = ReconcileCtx::new(Tunables::immediate());

    let err = Reconciler::new(&mut transport, &ctx)
        .update(&desired)
        .await
        .expect_err("commit was rejected");

    match err {
        ConfigError::Aborted {
            operation,
            phase,
            cause,
            cleanup,
            ..
        } => {
            assert_eq!(operation, Operation::Update);
            assert_eq!(phase, Phase::Committing);
            assert!(matches!(*cause, ConfigError::Commit { .. }));
            assert!(cleanup.is_empty(), "clean rollback reports no trouble");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Rollback ran exactly once: one discard, one unlock, nothing after.
    assert!(transport.is_exhausted());
    let requests = transport.requests_seen();
    assert_eq!(requests.iter().filter(|r| **r == DISCARD_RPC).count(), 1);
    assert_eq!(requests.iter().filter(|r| **r == UNLOCK_RPC).count(), 1);
}

#[tokio::test]
async fn rollback_trouble_never_masks_the_original_failure() {
    let desired = simple_app("api-gw", 9443);
    let live = simple_app("api-gw", 8443);
    let encoded = encode_resource(&desired).expect("encode");
    let mut delta = ConfigDelta::new();
    delta.delete(&desired.base_path());
    delta.extend(encoded);

    let commit_rejected = "<rpc-error><error-severity>error</error-severity>\
        <error-message>commit failed: conflict</error-message></rpc-error>";
    let mut transport = ScriptedTransport::new(vec![
        ScriptEntry::ok(show_cmd(&desired), dump_reply(&live)),
        ScriptEntry::ok(LOCK_RPC, "<ok/>"),
        ScriptEntry::ok(load_set_rpc(&delta.to_text()), "<ok/>"),
        ScriptEntry::ok(commit_rpc("update api-gw"), commit_rejected),
        ScriptEntry::failing(DISCARD_RPC, "channel reset"),
        ScriptEntry::failing(UNLOCK_RPC, "channel reset"),
    ]);
    let ctx = ReconcileCtx::new(Tunables::immediate());

    let err = Reconciler::new(&mut transport, &ctx)
        .update(&desired)
        .await
        .expect_err("commit was rejected");

    match err {
        ConfigError::Aborted { cause, cleanup, .. } => {
            assert!(matches!(*cause, ConfigError::Commit { .. }));
            assert_eq!(cleanup.len(), 1);
            assert!(cleanup[0].contains("discard"));
            assert!(cleanup[0].contains("unlock"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn cancellation_during_lock_wait_mutates_nothing() {
    let desired = simple_app("api-gw", 8443);
    let busy = "<rpc-error><error-severity>error</error-severity>\
        <error-message>configuration database locked</error-message></rpc-error>";
    let mut transport = ScriptedTransport::new(vec![
        ScriptEntry::ok(show_cmd(&desired), empty_reply()),
        ScriptEntry::ok(LOCK_RPC, busy),
    ]);
    let tunables = Tunables {
        lock_poll_interval: Duration::from_secs(3600),
        ..Tunables::immediate()
    };
    let ctx = ReconcileCtx::new(tunables);

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = Reconciler::new(&mut transport, &ctx)
        .create(&desired)
        .await
        .expect_err("cancelled during lock wait");

    assert!(matches!(err, ConfigError::LockAborted));
    // The diff read and one refused lock attempt happened; no load, no
    // commit, no rollback.
    assert_eq!(transport.exchanges_used(), 2);
}

#[tokio::test]
async fn delete_replaces_the_entity_with_one_delete_line() {
    let live = simple_app("api-gw", 8443);
    let mut delta = ConfigDelta::new();
    delta.delete(&live.base_path());

    let mut transport = ScriptedTransport::new(vec![
        ScriptEntry::ok(show_cmd(&live), dump_reply(&live)),
        ScriptEntry::ok(LOCK_RPC, "<ok/>"),
        ScriptEntry::ok(load_set_rpc(&delta.to_text()), "<ok/>"),
        ScriptEntry::ok(commit_rpc("delete api-gw"), "<ok/>"),
        ScriptEntry::ok(show_cmd(&live), empty_reply()),
        ScriptEntry::ok(UNLOCK_RPC, "<ok/>"),
    ]);
    let ctx = ReconcileCtx::new(Tunables::immediate());

    let warnings = Reconciler::new(&mut transport, &ctx)
        .delete(&live)
        .await
        .expect("delete succeeds");

    assert!(warnings.is_empty());
    assert!(transport.is_exhausted());
}

#[tokio::test]
async fn contradictory_record_fails_before_any_exchange() {
    let invalid = Application {
        name: "api-gw".to_string(),
        protocol: Some("tcp".to_string()),
        destination_port: None,
        terms: vec![Term {
            name: "primary".to_string(),
            protocol: Some("tcp".to_string()),
            destination_port: Some(443),
        }],
    };
    let mut transport = ScriptedTransport::new(Vec::new());
    let ctx = ReconcileCtx::new(Tunables::immediate());

    let err = Reconciler::new(&mut transport, &ctx)
        .create(&invalid)
        .await
        .expect_err("contradictory record");

    assert!(matches!(err, ConfigError::Validation { .. }));
    assert_eq!(transport.exchanges_used(), 0);
}

#[tokio::test]
async fn fixture_read_groups_term_lines_by_key() {
    let probe = Application {
        name: "dns-custom".to_string(),
        ..Default::default()
    };
    let mut transport =
        ScriptedTransport::from_jsonl(APPLICATION_READ_FIXTURE).expect("load fixture");
    let ctx = ReconcileCtx::new(Tunables::immediate());

    let live = Reconciler::new(&mut transport, &ctx)
        .read(&probe)
        .await
        .expect("read")
        .expect("entity present");

    assert_eq!(live.terms.len(), 2);
    assert_eq!(live.terms[0].name, "primary");
    assert_eq!(live.terms[0].protocol.as_deref(), Some("udp"));
    assert_eq!(live.terms[0].destination_port, Some(53));
    assert_eq!(live.terms[1].name, "fallback");
    assert_eq!(live.terms[1].protocol.as_deref(), Some("tcp"));
    assert!(transport.is_exhausted());
}

#[tokio::test]
async fn post_commit_readback_mismatch_is_reported_as_inconsistency() {
    let desired = simple_app("api-gw", 8443);
    let delta = encode_resource(&desired).expect("encode");
    let mut transport = ScriptedTransport::new(vec![
        ScriptEntry::ok(show_cmd(&desired), empty_reply()),
        ScriptEntry::ok(LOCK_RPC, "<ok/>"),
        ScriptEntry::ok(load_set_rpc(&delta.to_text()), "<ok/>"),
        ScriptEntry::ok(commit_rpc("create api-gw"), "<ok/>"),
        // The device accepted the commit yet still dumps nothing back.
        ScriptEntry::ok(show_cmd(&desired), empty_reply()),
        ScriptEntry::ok(UNLOCK_RPC, "<ok/>"),
    ]);
    let ctx = ReconcileCtx::new(Tunables::immediate());

    let err = Reconciler::new(&mut transport, &ctx)
        .create(&desired)
        .await
        .expect_err("readback contradicted the commit");

    assert!(matches!(err, ConfigError::PostCommitConsistency { .. }));
    assert!(transport.is_exhausted());
}
