use ciflow_core::NotificationEvent;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How the webhook endpoint expects its body.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookType {
    /// Block-layout message posted straight into a channel.
    #[default]
    IncomingWebhook,
    /// Flat variables consumed by a workflow on the receiving side.
    WorkflowTrigger,
}

impl WebhookType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "incoming_webhook" => Some(Self::IncomingWebhook),
            "workflow_trigger" => Some(Self::WorkflowTrigger),
            _ => None,
        }
    }
}

fn describe_trigger(ev: &NotificationEvent) -> String {
    let target = ev
        .git_ref
        .strip_prefix("refs/heads/")
        .or_else(|| ev.git_ref.strip_prefix("refs/tags/"))
        .unwrap_or(&ev.git_ref);
    format!("Triggered by a `{}` event on `{}`", ev.event_name, target)
}

/// Builds the request body for `kind`.
///
/// The block layout is: actor context, job/workflow section, trigger
/// context, repository/run context.
pub fn build_payload(ev: &NotificationEvent, kind: WebhookType) -> Value {
    match kind {
        WebhookType::IncomingWebhook => json!({
            "text": format!("{} failed in {}", ev.job_name, ev.workflow),
            "blocks": [
                {
                    "type": "context",
                    "elements": [
                        { "type": "image", "image_url": ev.actor_avatar_url(), "alt_text": ev.actor },
                        { "type": "mrkdwn", "text": format!("<{}|*{}*>", ev.actor_url(), ev.actor) }
                    ]
                },
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": format!(
                            ":x: Job *{}* failed in workflow *<{}|{}>*",
                            ev.job_name,
                            ev.run_url(),
                            ev.workflow
                        )
                    }
                },
                {
                    "type": "context",
                    "elements": [ { "type": "mrkdwn", "text": describe_trigger(ev) } ]
                },
                {
                    "type": "context",
                    "elements": [
                        { "type": "mrkdwn", "text": format!("<{}|{}>", ev.repository_url(), ev.repository) },
                        {
                            "type": "mrkdwn",
                            "text": format!("<{}|Run #{} (attempt {})>", ev.run_url(), ev.run_number, ev.run_attempt)
                        }
                    ]
                }
            ]
        }),
        WebhookType::WorkflowTrigger => json!({
            "actor": ev.actor,
            "job": ev.job_name,
            "workflow": ev.workflow,
            "repository": ev.repository,
            "run_id": ev.run_id,
            "run_attempt": ev.run_attempt.to_string(),
            "run_number": ev.run_number.to_string(),
            "event_name": ev.event_name,
            "ref": ev.git_ref,
            "run_url": ev.run_url(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> NotificationEvent {
        NotificationEvent {
            actor: "octo".into(),
            job_name: "format-check".into(),
            workflow: "tests".into(),
            repository: "acme/widgets".into(),
            run_id: "77".into(),
            run_attempt: 1,
            run_number: 12,
            event_name: "push".into(),
            git_ref: "refs/heads/main".into(),
            server_url: "https://git.example.com".into(),
        }
    }

    #[test]
    fn incoming_webhook_has_four_blocks_in_order() {
        let body = build_payload(&event(), WebhookType::IncomingWebhook);
        let blocks = body["blocks"].as_array().unwrap();
        let types: Vec<_> = blocks.iter().map(|b| b["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["context", "section", "context", "context"]);

        assert_eq!(blocks[0]["elements"][0]["type"], "image");
        assert_eq!(blocks[0]["elements"][0]["image_url"], "https://git.example.com/octo.png?size=32");
        let section = blocks[1]["text"]["text"].as_str().unwrap();
        assert!(section.contains("*format-check*"));
        assert!(section.contains("https://git.example.com/acme/widgets/actions/runs/77"));
        assert_eq!(blocks[2]["elements"][0]["text"], "Triggered by a `push` event on `main`");
        let run_link = blocks[3]["elements"][1]["text"].as_str().unwrap();
        assert!(run_link.contains("Run #12 (attempt 1)"));
    }

    #[test]
    fn workflow_trigger_is_flat() {
        let body = build_payload(&event(), WebhookType::WorkflowTrigger);
        assert_eq!(body["job"], "format-check");
        assert_eq!(body["run_number"], "12");
        assert!(body.get("blocks").is_none());
    }

    #[test]
    fn parses_webhook_type_spellings() {
        assert_eq!(WebhookType::parse("INCOMING_WEBHOOK"), Some(WebhookType::IncomingWebhook));
        assert_eq!(WebhookType::parse("workflow-trigger"), Some(WebhookType::WorkflowTrigger));
        assert_eq!(WebhookType::parse("email"), None);
    }
}
