use std::io::{Cursor, Write};

use omnifetch::{FetchConfig, FetchError, Fetcher, GitHub, RetryPolicy};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

fn github(server: &MockServer) -> GitHub {
    let config = FetchConfig {
        github_api: server.uri(),
        github_web: server.uri(),
        retry: RetryPolicy::none(),
        ..FetchConfig::isolated()
    };
    GitHub::new(Fetcher::new(config).unwrap())
}

fn listing(server: &MockServer) -> serde_json::Value {
    json!([
        {"type": "file", "name": "a.json", "download_url": format!("{}/raw/a.json", server.uri())},
        {"type": "file", "name": "b.json", "download_url": format!("{}/raw/b.json", server.uri())},
        {"type": "dir", "name": "nested", "download_url": null},
        {"type": "file", "name": "c.json", "download_url": format!("{}/raw/c.json", server.uri())},
        {"type": "file", "name": "notes.txt", "download_url": format!("{}/raw/notes.txt", server.uri())}
    ])
}

async fn serve_raw(server: &MockServer, name: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/raw/{}", name)))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn directory_download_skips_failed_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/user/repo/contents/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(&server)))
        .mount(&server)
        .await;
    serve_raw(&server, "a.json", "{\"a\": 1}").await;
    serve_raw(&server, "c.json", "{\"c\": 3}").await;
    serve_raw(&server, "notes.txt", "notes").await;
    // b.json is not mounted, so it answers 404.

    let dir = tempfile::tempdir().unwrap();
    let files = github(&server)
        .download_directory_files("user", "repo", "data", dir.path(), Some(".json"))
        .await;

    assert_eq!(files, vec![dir.path().join("a.json"), dir.path().join("c.json")]);
    assert_eq!(std::fs::read_to_string(dir.path().join("c.json")).unwrap(), "{\"c\": 3}");
    assert!(!dir.path().join("notes.txt").exists());
}

#[tokio::test]
async fn directory_without_filter_takes_every_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/user/repo/contents/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(&server)))
        .mount(&server)
        .await;
    serve_raw(&server, "a.json", "a").await;
    serve_raw(&server, "b.json", "b").await;
    serve_raw(&server, "c.json", "c").await;
    serve_raw(&server, "notes.txt", "notes").await;

    let dir = tempfile::tempdir().unwrap();
    let files = github(&server)
        .download_directory_files("user", "repo", "data", dir.path(), None)
        .await;
    assert_eq!(files.len(), 4);
}

#[tokio::test]
async fn unreachable_listing_yields_nothing() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let files = github(&server)
        .download_directory_files("user", "repo", "missing", dir.path(), None)
        .await;
    assert!(files.is_empty());
}

#[tokio::test]
async fn token_is_sent_as_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/user/repo/contents/data"))
        .and(header("authorization", "token s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let github = github(&server).with_token(Some("s3cret".to_string()));
    assert!(github.is_authenticated());
    let files = github
        .download_directory_files("user", "repo", "data", dir.path(), None)
        .await;
    assert!(files.is_empty());
}

fn repository_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer.add_directory("myrepo-main/", options).unwrap();
    writer.start_file("myrepo-main/README.md", options).unwrap();
    writer.write_all(b"# myrepo\n").unwrap();
    writer.start_file("myrepo-main/src/lib.rs", options).unwrap();
    writer.write_all(b"pub fn answer() -> u32 { 42 }\n").unwrap();
    writer.finish().unwrap().into_inner()
}

#[tokio::test]
async fn repository_is_unpacked_and_zip_removed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/myrepo/archive/refs/heads/main.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(repository_zip()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let extracted = github(&server)
        .download_repository("user", "myrepo", dir.path(), "main")
        .await
        .unwrap();

    assert_eq!(extracted, dir.path().join("myrepo-main"));
    assert_eq!(std::fs::read_to_string(extracted.join("README.md")).unwrap(), "# myrepo\n");
    assert!(extracted.join("src").join("lib.rs").is_file());
    assert!(!dir.path().join("temp.zip").exists());
}

#[tokio::test]
async fn missing_branch_is_an_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let result = github(&server)
        .download_repository("user", "myrepo", dir.path(), "nope")
        .await;
    assert!(result.is_err());
}

async fn serve_archive(server: &MockServer, bytes: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path("/user/myrepo/archive/refs/heads/main.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
        .mount(server)
        .await;
}

#[tokio::test]
async fn empty_repository_archive_falls_back_to_repo_branch() {
    let server = MockServer::start().await;
    let empty = zip::ZipWriter::new(Cursor::new(Vec::new())).finish().unwrap().into_inner();
    serve_archive(&server, empty).await;

    let dir = tempfile::tempdir().unwrap();
    let extracted = github(&server)
        .download_repository("user", "myrepo", dir.path(), "main")
        .await
        .unwrap();

    assert_eq!(extracted, dir.path().join("myrepo-main"));
    assert!(!dir.path().join("temp.zip").exists());
}

#[tokio::test]
async fn root_level_files_fall_back_to_repo_branch() {
    let server = MockServer::start().await;
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file("README.md", SimpleFileOptions::default()).unwrap();
    writer.write_all(b"flat\n").unwrap();
    serve_archive(&server, writer.finish().unwrap().into_inner()).await;

    let dir = tempfile::tempdir().unwrap();
    let extracted = github(&server)
        .download_repository("user", "myrepo", dir.path(), "main")
        .await
        .unwrap();

    assert_eq!(extracted, dir.path().join("myrepo-main"));
    assert_eq!(std::fs::read_to_string(dir.path().join("README.md")).unwrap(), "flat\n");
    assert!(!dir.path().join("temp.zip").exists());
}

#[tokio::test]
async fn json_documents_are_decoded_from_text() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw/config.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"name\": \"omnifetch\", \"stars\": 3}"))
        .mount(&server)
        .await;
    serve_raw(&server, "broken.json", "<html>not json</html>").await;

    let github = github(&server);
    let value: serde_json::Value = github
        .get_data_json(&format!("{}/raw/config.json", server.uri()))
        .await
        .unwrap();
    assert_eq!(value, json!({"name": "omnifetch", "stars": 3}));

    let err = github
        .get_data_json::<serde_json::Value>(&format!("{}/raw/broken.json", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Json(_)));
}
