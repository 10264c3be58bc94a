//! Lists departments with the organization secret, then sends a text
//! message as a named agent.
//!
//! Credentials come from the environment:
//! `WECOM_CORP_ID`, `WECOM_CORP_SECRET`, `WECOM_AGENT_ID`, `WECOM_AGENT_SECRET`.
//!
//! Run with: `cargo run --example basic_dispatch`

use serde::{Deserialize, Serialize};
use wecom_dispatch::{AgentCredential, Client, Context, Error};

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Department {
    id: u64,
    name: String,
    #[serde(default)]
    parentid: u64,
}

#[derive(Debug, Deserialize)]
struct DepartmentList {
    department: Vec<Department>,
}

#[derive(Debug, Serialize)]
struct Text {
    content: String,
}

#[derive(Debug, Serialize)]
struct TextMessage {
    touser: String,
    msgtype: &'static str,
    agentid: i64,
    text: Text,
}

#[derive(Debug, Deserialize)]
struct SendResult {
    #[serde(default)]
    msgid: String,
}

fn env(name: &str) -> Result<String, Error> {
    std::env::var(name).map_err(|_| Error::Configuration(format!("{name} is not set")))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter("wecom_dispatch=debug,basic_dispatch=info")
        .init();

    let agent_id: i64 = env("WECOM_AGENT_ID")?
        .parse()
        .map_err(|e| Error::Configuration(format!("WECOM_AGENT_ID: {e}")))?;

    let client = Client::builder()
        .corp_id(env("WECOM_CORP_ID")?)
        .default_secret(env("WECOM_CORP_SECRET")?)
        .agent(AgentCredential::new(agent_id, env("WECOM_AGENT_SECRET")?, "notify"))
        .retry_count(2)
        .debug(true)
        .build()?;

    println!("=== Departments (organization secret) ===");
    let response = client
        .get::<DepartmentList>(&Context::new(), "/cgi-bin/department/list")
        .await?;
    for d in &response.data.department {
        println!("{:>6} {} (parent {})", d.id, d.name, d.parentid);
    }
    println!("Request latency: {:?}", response.latency);
    println!();

    println!("=== Text message (agent \"notify\") ===");
    let ctx = Context::new()
        .with_agent_name("notify")
        .with_trace_id("basic-dispatch-demo");
    let message = TextMessage {
        touser: "@all".to_string(),
        msgtype: "text",
        agentid: agent_id,
        text: Text {
            content: "hello from wecom-dispatch".to_string(),
        },
    };
    let response = client
        .post::<_, SendResult>(&ctx, "/cgi-bin/message/send", &message)
        .await?;

    println!("Message id: {}", response.data.msgid);
    println!("Attempts: {}", response.attempts);
    println!("Token refreshed: {}", response.token_refreshed);
    println!("Tokens fetched so far: {}", client.token_cache().fetch_count());

    Ok(())
}
