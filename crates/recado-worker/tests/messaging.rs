mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;
use recado_core::{ContactIdentity, Direction, MessageStatus, TemplateVariable};
use recado_db::TemplatePatch;
use recado_worker::{
    CreateTemplate, ErrorKind, OutboundBody, SendRequest, ServiceConfig, ServiceError,
    ViewerScope,
};
use serde_json::{Map, Value, json};

use common::{Harness, harness, harness_with, inbound, message_event, test_config};

fn values(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

async fn contact_with_message(h: &Harness, wa_id: &str, external_id: &str, ts: i64) -> i64 {
    h.worker
        .handle_event(&h.instance, inbound(&h.instance.id, external_id, wa_id, "Olá", ts))
        .await
        .unwrap();
    h.db
        .get_contacts(&h.instance.id)
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.wa_id == wa_id)
        .unwrap()
        .id
}

fn text(h: &Harness, contact_id: i64, content: &str) -> SendRequest {
    SendRequest {
        instance_id: h.instance.id.clone(),
        contact_id,
        body: OutboundBody::Text {
            content: content.to_string(),
        },
    }
}

#[tokio::test]
async fn sends_rendered_enrollment_template() {
    let h = harness().await;
    h.connect().await;
    let contact_id = contact_with_message(&h, "5511911112222", "wamid.in", 100).await;

    let template = h
        .worker
        .templates()
        .create(
            &ViewerScope::School("school-1".into()),
            CreateTemplate {
                school_id: None,
                name: "Matrícula confirmada".into(),
                category: "enrollment".into(),
                content: "Olá {{name}}, sua matrícula para {{course}} foi confirmada.".into(),
                variables: Vec::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(template.school_id.as_deref(), Some("school-1"));

    let sent = h
        .worker
        .dispatcher()
        .send(&ViewerScope::Admin, SendRequest {
            instance_id: h.instance.id.clone(),
            contact_id,
            body: OutboundBody::Template {
                template_id: template.id.clone(),
                variables: values(json!({ "name": "Ana", "course": "Inglês" })),
            },
        })
        .await
        .unwrap();

    assert_eq!(
        sent.content.as_deref(),
        Some("Olá Ana, sua matrícula para Inglês foi confirmada.")
    );
    assert_eq!(sent.status, MessageStatus::Sent);
    assert_eq!(sent.external_id.as_deref(), Some("wamid.out-1"));
    assert!(sent.sent_at.is_some());

    let err = h
        .worker
        .dispatcher()
        .send(&ViewerScope::Admin, SendRequest {
            instance_id: h.instance.id.clone(),
            contact_id,
            body: OutboundBody::Template {
                template_id: template.id,
                variables: values(json!({ "name": "Ana" })),
            },
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("course"));
    assert_eq!(h.gateway.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn send_requires_a_connected_instance() {
    let h = harness().await;
    let contact_id = contact_with_message(&h, "5511911112222", "wamid.in", 100).await;

    let err = h
        .worker
        .dispatcher()
        .send(&ViewerScope::Admin, text(&h, contact_id, "Oi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotConnected(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let thread = h.db.get_thread(contact_id, 50, 0).await.unwrap();
    assert_eq!(thread.len(), 1);
}

#[tokio::test]
async fn gateway_rejection_marks_message_failed() {
    let h = harness().await;
    h.connect().await;
    let contact_id = contact_with_message(&h, "5511911112222", "wamid.in", 100).await;
    h.gateway.fail_send.store(true, Ordering::SeqCst);

    let err = h
        .worker
        .dispatcher()
        .send(&ViewerScope::Admin, text(&h, contact_id, "Oi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalService);

    let thread = h.db.get_thread(contact_id, 50, 0).await.unwrap();
    let last = thread.last().unwrap();
    assert_eq!(last.status, MessageStatus::Failed);
    assert_eq!(last.external_id, None);
    assert!(last.metadata.as_deref().unwrap().contains("502"));
}

#[tokio::test]
async fn send_timeout_is_a_failure_not_pending() {
    let h = harness_with(ServiceConfig {
        gateway_timeout: Duration::from_millis(50),
        ..test_config()
    })
    .await;
    h.connect().await;
    let contact_id = contact_with_message(&h, "5511911112222", "wamid.in", 100).await;
    *h.gateway.send_delay.lock().unwrap() = Some(Duration::from_secs(2));

    let err = h
        .worker
        .dispatcher()
        .send(&ViewerScope::Admin, text(&h, contact_id, "Oi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::ExternalService(recado_gateway::GatewayError::Timeout)
    ));

    let thread = h.db.get_thread(contact_id, 50, 0).await.unwrap();
    assert_eq!(thread.last().unwrap().status, MessageStatus::Failed);
}

#[tokio::test]
async fn send_to_contact_of_other_instance_is_not_found() {
    let h = harness().await;
    h.connect().await;
    let other = h
        .db
        .create_instance(&recado_db::NewInstance {
            school_id: "school-2".into(),
            name: "Escola Sul".into(),
            gateway_instance_id: "gw-2".into(),
            gateway_token: "token-2".into(),
            webhook_url: None,
            webhook_secret: None,
        })
        .await
        .unwrap();
    let stranger = h
        .db
        .upsert_contact(
            &other.id,
            &ContactIdentity {
                wa_id: "5521900000000".into(),
                name: None,
                phone: None,
                is_group: false,
            },
        )
        .await
        .unwrap();

    let err = h
        .worker
        .dispatcher()
        .send(&ViewerScope::Admin, text(&h, stranger.id, "Oi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn conversations_track_unread_and_ignore_silent_contacts() {
    let h = harness().await;
    let ana = contact_with_message(&h, "5511911110001", "wamid.a1", 100).await;
    contact_with_message(&h, "5511911110001", "wamid.a2", 110).await;
    let bruno = contact_with_message(&h, "5511911110002", "wamid.b1", 120).await;
    h.db
        .upsert_contact(
            &h.instance.id,
            &ContactIdentity {
                wa_id: "5511911110003".into(),
                name: Some("Sem mensagens".into()),
                phone: None,
                is_group: false,
            },
        )
        .await
        .unwrap();

    let scope = ViewerScope::School("school-1".into());
    let conversations = h.worker.conversations();
    let list = conversations.list_conversations(&scope, None).await.unwrap();

    let order: Vec<i64> = list.iter().map(|c| c.contact.id).collect();
    assert_eq!(order, vec![bruno, ana]);
    assert_eq!(list[1].unread_count, 2);
    assert_eq!(list[1].last_message.external_id.as_deref(), Some("wamid.a2"));

    assert_eq!(conversations.mark_read(&scope, ana, None).await.unwrap(), 2);
    assert_eq!(conversations.mark_read(&scope, ana, None).await.unwrap(), 0);

    let list = conversations.list_conversations(&scope, None).await.unwrap();
    let ana_entry = list.iter().find(|c| c.contact.id == ana).unwrap();
    assert_eq!(ana_entry.unread_count, 0);
}

#[tokio::test]
async fn opening_a_thread_marks_it_read() {
    let h = harness().await;
    let ana = contact_with_message(&h, "5511911110001", "wamid.a1", 100).await;
    contact_with_message(&h, "5511911110001", "wamid.a2", 110).await;
    let scope = ViewerScope::Admin;

    let thread = h
        .worker
        .conversations()
        .open_thread(&scope, ana, None, None)
        .await
        .unwrap();
    assert_eq!(thread.len(), 2);
    assert!(thread.iter().all(|m| m.status == MessageStatus::Read));
    assert_eq!(thread[0].external_id.as_deref(), Some("wamid.a1"));

    let list = h
        .worker
        .conversations()
        .list_conversations(&scope, Some(&h.instance.id))
        .await
        .unwrap();
    assert_eq!(list[0].unread_count, 0);
}

#[tokio::test]
async fn mark_read_up_to_a_message_leaves_later_ones() {
    let h = harness().await;
    let ana = contact_with_message(&h, "5511911110001", "wamid.a1", 100).await;
    contact_with_message(&h, "5511911110001", "wamid.a2", 110).await;
    let first = h
        .db
        .find_message_by_external_id(&h.instance.id, "wamid.a1")
        .await
        .unwrap()
        .unwrap();

    let marked = h
        .worker
        .conversations()
        .mark_read(&ViewerScope::Admin, ana, Some(first.id))
        .await
        .unwrap();
    assert_eq!(marked, 1);
}

#[tokio::test]
async fn cached_conversations_refresh_after_new_message() {
    let h = harness().await;
    contact_with_message(&h, "5511911110001", "wamid.a1", 100).await;
    let scope = ViewerScope::Admin;
    let conversations = h.worker.conversations();

    let before = conversations
        .list_conversations(&scope, Some(&h.instance.id))
        .await
        .unwrap();
    assert_eq!(before.len(), 1);

    contact_with_message(&h, "5511911110002", "wamid.b1", 200).await;
    let after = conversations
        .list_conversations(&scope, Some(&h.instance.id))
        .await
        .unwrap();
    assert_eq!(after.len(), 2);
    assert_eq!(after[0].last_message.external_id.as_deref(), Some("wamid.b1"));
}

#[tokio::test]
async fn other_schools_cannot_see_conversations() {
    let h = harness().await;
    let ana = contact_with_message(&h, "5511911110001", "wamid.a1", 100).await;
    let outsider = ViewerScope::School("school-2".into());
    let conversations = h.worker.conversations();

    let err = conversations
        .list_conversations(&outsider, Some(&h.instance.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = conversations.open_thread(&outsider, ana, None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = conversations
        .list_conversations(&ViewerScope::Admin, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn template_ownership_rules() {
    let h = harness().await;
    let templates = h.worker.templates();
    let admin = ViewerScope::Admin;
    let school = ViewerScope::School("school-1".into());
    let other = ViewerScope::School("school-2".into());

    let global = templates
        .create(
            &admin,
            CreateTemplate {
                school_id: None,
                name: "Boas-vindas".into(),
                category: "general".into(),
                content: "Bem-vindo, {{name}}!".into(),
                variables: vec![TemplateVariable::new("name")],
            },
        )
        .await
        .unwrap();

    let patch = TemplatePatch {
        content: Some("Olá, {{name}}! Vencimento em {{due}}.".into()),
        ..Default::default()
    };
    let err = templates.update(&school, &global.id, patch.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let updated = templates.update(&admin, &global.id, patch).await.unwrap();
    let names: Vec<String> = updated.variables().into_iter().map(|v| v.name).collect();
    assert_eq!(names, vec!["name".to_string(), "due".to_string()]);

    let own = templates
        .create(
            &school,
            CreateTemplate {
                school_id: Some("school-1".into()),
                name: "Lembrete".into(),
                category: "billing".into(),
                content: "Sua mensalidade vence {{due}}.".into(),
                variables: Vec::new(),
            },
        )
        .await
        .unwrap();

    let err = templates.get(&other, &own.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = templates
        .create(
            &other,
            CreateTemplate {
                school_id: Some("school-1".into()),
                name: "Intruso".into(),
                category: "general".into(),
                content: "x".into(),
                variables: Vec::new(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let listed = templates.list(&school, None).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(templates.list(&other, None).await.unwrap().len(), 1);

    templates.deactivate(&school, &own.id).await.unwrap();
    assert_eq!(templates.list(&school, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn contacts_are_listed_and_linked_within_scope() {
    let h = harness().await;
    let contact_id = contact_with_message(&h, "5511933334444", "wamid.c1", 10).await;
    let conversations = h.worker.conversations();
    let school = ViewerScope::School("school-1".into());

    let contacts = conversations.contacts(&school, None).await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].wa_id, "5511933334444");

    let linked = conversations
        .link_contact(&school, contact_id, Some("lead-9"), None)
        .await
        .unwrap();
    assert_eq!(linked.lead_id.as_deref(), Some("lead-9"));

    let linked = conversations
        .link_contact(&ViewerScope::Admin, contact_id, None, Some("student-3"))
        .await
        .unwrap();
    assert_eq!(linked.lead_id.as_deref(), Some("lead-9"));
    assert_eq!(linked.student_id.as_deref(), Some("student-3"));

    let err = conversations
        .link_contact(&school, contact_id, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = conversations
        .link_contact(&ViewerScope::School("school-2".into()), contact_id, Some("x"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn echo_arriving_mid_send_leaves_a_single_outbound_row() {
    let h = harness().await;
    h.connect().await;
    let wa_id = "5511911112222";
    let contact_id = contact_with_message(&h, wa_id, "wamid.in", 100).await;
    *h.gateway.send_delay.lock().unwrap() = Some(Duration::from_millis(200));

    let dispatcher = h.worker.dispatcher();
    let (sent, echo) = tokio::join!(
        dispatcher.send(&ViewerScope::Admin, text(&h, contact_id, "Oi")),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.worker
                .handle_event(
                    &h.instance,
                    message_event(&h.instance.id, "wamid.out-1", wa_id, "Oi", 150, Direction::Outbound),
                )
                .await
        },
    );
    echo.unwrap();
    let sent = sent.unwrap();
    assert_eq!(sent.external_id.as_deref(), Some("wamid.out-1"));
    assert_eq!(sent.status, MessageStatus::Sent);

    let thread = h.db.get_thread(contact_id, 50, 0).await.unwrap();
    let outbound: Vec<_> = thread
        .iter()
        .filter(|m| m.direction == Direction::Outbound)
        .collect();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].id, sent.id);

    let provisional = h.db.get_message(sent.id - 1).await.unwrap();
    assert_eq!(provisional.direction, Direction::Outbound);
    assert_eq!(provisional.status, MessageStatus::Failed);
    assert!(provisional.metadata.as_deref().unwrap().contains("wamid.out-1"));
}

#[tokio::test]
async fn other_schools_cannot_send_through_an_instance() {
    let h = harness().await;
    h.connect().await;
    let contact_id = contact_with_message(&h, "5511911112222", "wamid.in", 100).await;

    let err = h
        .worker
        .dispatcher()
        .send(&ViewerScope::School("school-2".into()), text(&h, contact_id, "Oi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(h.gateway.sent.lock().unwrap().is_empty());

    let thread = h.db.get_thread(contact_id, 50, 0).await.unwrap();
    assert_eq!(thread.len(), 1);
}
