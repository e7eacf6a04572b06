// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end CLI test: runs the compiled `harvest` binary against a mock
//! OAI-PMH server and checks its on-disk side effects (the JSONL sink, the
//! persisted harvest state), the way an operator would actually invoke it.

use std::{path::PathBuf, process::Command};

use serial_test::serial;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, query_param},
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[tokio::test]
#[serial]
async fn harvest_subcommand_persists_records_and_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("verb", "Identify"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><responseDate>2024-05-01T00:00:00Z</responseDate>
               <Identify><granularity>YYYY-MM-DD</granularity></Identify></OAI-PMH>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("verb", "ListRecords"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><responseDate>2024-05-01T00:00:00Z</responseDate>
               <ListRecords><record><header><identifier>rec-1</identifier><datestamp>2024-04-30</datestamp></header>
               <metadata><dc:dc xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>T</dc:title></dc:dc></metadata></record></ListRecords></OAI-PMH>"#,
        ))
        .mount(&server)
        .await;

    let tmp = std::env::temp_dir().join(format!("oai-harvest-pool-cli-test-{}", std::process::id()));
    std::fs::create_dir_all(&tmp).unwrap();
    let config_path = tmp.join("deployment.yaml");
    std::fs::write(
        &config_path,
        format!(
            "sources:\n  demo:\n    baseUrl: \"{}\"\n    metadataPrefix: oai_dc\npool:\n  workers: 0\n  queueBound: 4\nhttp:\n  maxTries: 1\n  retryWait: 1\n  timeout: 5\nstateDir: state\n",
            server.uri()
        ),
    )
    .unwrap();

    let binary = PathBuf::from(env!("CARGO_BIN_EXE_harvest"));
    let status = Command::new(&binary)
        .arg("harvest")
        .arg("--config")
        .arg(&config_path)
        .arg("--log-config")
        .arg(fixture("log_config.yaml"))
        .arg("--source")
        .arg("demo")
        .current_dir(&tmp)
        .status()
        .unwrap();
    assert!(status.success());

    let sink_contents = std::fs::read_to_string(tmp.join("output/demo.jsonl")).unwrap();
    assert_eq!(sink_contents.lines().count(), 1);
    assert!(sink_contents.contains("rec-1"));

    let state_contents = std::fs::read_to_string(tmp.join("state/demo.json")).unwrap();
    assert!(state_contents.contains("2024-05-01"));
}
