use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use image::{DynamicImage, Rgb, RgbImage};
use pacs_ingest::orchestrator::{DirectoryWalk, ItemState, Stage};
use pacs_ingest::uploader::{Archive, UploadError, UploadOutcome};
use pacs_ingest::{
    ArchiveEndpoint, ArchiveUploader, BatchOrchestrator, ContainerBuilder, Credentials,
    OrchestratorOptions,
};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::Filter;

/// What the mock archive saw
#[derive(Debug, Default)]
struct Received {
    hits: AtomicUsize,
    content_types: Mutex<Vec<String>>,
    authorizations: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Vec<u8>>>,
}

/// Serve `POST /instances` answering every request with `status`.
fn spawn_archive(status: StatusCode) -> (SocketAddr, Arc<Received>) {
    let received = Arc::new(Received::default());
    let state = received.clone();
    let route = warp::path!("instances")
        .and(warp::post())
        .and(warp::header::<String>("content-type"))
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::bytes())
        .map(move |content_type: String, auth: Option<String>, body: Bytes| {
            state.hits.fetch_add(1, Ordering::SeqCst);
            let auth = auth.unwrap_or_default();
            state.content_types.lock().unwrap().push(content_type);
            state.authorizations.lock().unwrap().push(auth);
            state.bodies.lock().unwrap().push(body.to_vec());
            let reply = if status == StatusCode::OK {
                warp::reply::json(&serde_json::json!({
                    "ID": "f7ff9e8b-7bb2a0e1-d2a8f1e2-40a9a1a0-0a0a0a0a",
                    "Path": "/instances/f7ff9e8b-7bb2a0e1-d2a8f1e2-40a9a1a0-0a0a0a0a",
                    "Status": "Success"
                }))
            } else {
                warp::reply::json(&serde_json::json!({ "Message": "rejected" }))
            };
            warp::reply::with_status(reply, status)
        });
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, received)
}

/// Serve `POST /instances` but only answer after `delay`.
fn spawn_stalled_archive(delay: Duration) -> SocketAddr {
    let route = warp::path!("instances")
        .and(warp::post())
        .and_then(move || stall(delay));
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

async fn stall(delay: Duration) -> Result<warp::reply::Json, warp::Rejection> {
    tokio::time::sleep(delay).await;
    let acknowledgement = serde_json::json!({ "Status": "Success" });
    Ok(warp::reply::json(&acknowledgement))
}

fn uploader_with_timeout(addr: SocketAddr, timeout: Duration) -> ArchiveUploader {
    let endpoint = ArchiveEndpoint::new(format!("http://{}", addr))
        .with_timeout(timeout);
    let credentials = Credentials::new("orthanc", "orthanc");
    ArchiveUploader::new(endpoint, credentials).unwrap()
}

fn uploader(addr: SocketAddr) -> ArchiveUploader {
    uploader_with_timeout(addr, Duration::from_secs(10))
}

fn write_jpeg(path: &Path, width: u32, height: u32) {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    DynamicImage::ImageRgb8(img).save(path).unwrap();
}

fn number(obj: &InMemDicomObject, tag: Tag) -> u16 {
    obj.element(tag).unwrap().to_int::<u16>().unwrap()
}

fn sample_container() -> Vec<u8> {
    let img = RgbImage::from_fn(6, 4, |x, y| Rgb([x as u8, y as u8, 0]));
    let mut png = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut png, image::ImageFormat::Png)
        .unwrap();
    let source = pacs_ingest::SourceImage::from_bytes("sample.png", png.into_inner());
    let container = ContainerBuilder::new().build(&source).unwrap();
    container.to_bytes().unwrap()
}

#[tokio::test]
async fn test_upload_accepted() {
    let (addr, received) = spawn_archive(StatusCode::OK);
    let container = sample_container();

    let result = uploader(addr).upload("sample.dcm", container.clone()).await;

    assert!(result.succeeded(), "{}", result.diagnostic());
    match &result.outcome {
        UploadOutcome::Accepted { acknowledgement } => {
            assert_eq!(acknowledgement["Status"], "Success")
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(received.hits.load(Ordering::SeqCst), 1);
    let content_types = received.content_types.lock().unwrap();
    assert_eq!(content_types[0], "application/dicom");
    // base64("orthanc:orthanc")
    let authorizations = received.authorizations.lock().unwrap();
    assert_eq!(authorizations[0], "Basic b3J0aGFuYzpvcnRoYW5j");
    assert_eq!(received.bodies.lock().unwrap()[0], container);
}

#[tokio::test]
async fn test_upload_server_error() {
    let (addr, _) = spawn_archive(StatusCode::INTERNAL_SERVER_ERROR);
    let container = sample_container();
    let result = uploader(addr).upload("sample.dcm", container).await;

    assert!(!result.succeeded());
    assert_eq!(result.status(), Some(500));
    assert!(matches!(
        result.outcome,
        UploadOutcome::Rejected(UploadError::Rejected { .. })
    ));
    assert!(result.diagnostic().contains("500"));
    assert!(result.diagnostic().contains("rejected"));
}

#[tokio::test]
async fn test_upload_connection_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let container = sample_container();
    let result = uploader(addr).upload("sample.dcm", container).await;
    assert!(!result.succeeded());
    assert!(!result.diagnostic().is_empty());
}

#[tokio::test]
async fn test_upload_times_out_on_stalled_archive() {
    let addr = spawn_stalled_archive(Duration::from_secs(10));
    let uploader = uploader_with_timeout(addr, Duration::from_millis(200));
    let container = sample_container();

    let started = Instant::now();
    let result = uploader.upload("sample.dcm", container).await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    assert!(!result.succeeded());
    assert_eq!(result.status(), None);
    assert!(matches!(
        result.outcome,
        UploadOutcome::Rejected(UploadError::Transport { .. })
    ));
}

#[tokio::test]
async fn test_batch_with_unreadable_file() {
    let (addr, received) = spawn_archive(StatusCode::OK);
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("chest_xray");
    std::fs::create_dir_all(src.join("train/NORMAL")).unwrap();
    write_jpeg(&src.join("train/NORMAL/IM-0001.jpeg"), 32, 24);
    write_jpeg(&src.join("train/NORMAL/IM-0002.jpg"), 17, 40);
    let empty = src.join("train/NORMAL/IM-0003.jpeg");
    std::fs::write(empty, b"").unwrap();

    let out = dir.path().join("output_dicom");
    let orchestrator = BatchOrchestrator::new(
        ContainerBuilder::new(),
        Arc::new(uploader(addr)),
        OrchestratorOptions::new(&out),
    );
    let report = orchestrator
        .run_selected(&DirectoryWalk::default(), &src)
        .await
        .unwrap();

    assert_eq!(report.converted, 2);
    assert_eq!(report.upload_accepted, 2);
    assert_eq!(report.conversion_failed, 1);
    assert_eq!(report.upload_rejected, 0);
    assert_eq!(received.hits.load(Ordering::SeqCst), 2);

    let failed: Vec<_> = report.failures().collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].source.ends_with("IM-0003.jpeg"));
    assert_eq!(failed[0].state, ItemState::Failed(Stage::Conversion));

    // artifacts are readable DICOM with the source dimensions
    let obj = dicom_object::open_file(out.join("IM-0002.dcm")).unwrap();
    assert_eq!(number(&obj, tags::COLUMNS), 17);
    assert_eq!(number(&obj, tags::ROWS), 40);
    let modality = obj.element(tags::MODALITY).unwrap().to_str().unwrap();
    assert_eq!(modality, "CR");
    let pixels = obj.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
    assert_eq!(pixels.len(), 17 * 40);

    // the uploaded bytes are the persisted artifact
    let persisted = std::fs::read(out.join("IM-0001.dcm")).unwrap();
    let bodies = received.bodies.lock().unwrap();
    assert!(bodies.contains(&persisted));
}

#[tokio::test]
async fn test_batch_unauthorized() {
    let (addr, _) = spawn_archive(StatusCode::UNAUTHORIZED);
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("images");
    std::fs::create_dir_all(&src).unwrap();
    write_jpeg(&src.join("person1_virus_6.jpeg"), 20, 20);

    let orchestrator = BatchOrchestrator::new(
        ContainerBuilder::new(),
        Arc::new(uploader(addr)),
        OrchestratorOptions::new(dir.path().join("out")),
    );
    let report = orchestrator
        .run_selected(&DirectoryWalk::default(), &src)
        .await
        .unwrap();

    assert_eq!(report.converted, 1);
    assert_eq!(report.upload_accepted, 0);
    assert_eq!(report.upload_rejected, 1);
    assert_eq!(report.items[0].status, Some(401));
    assert!(report.items[0].message.contains("401"));
}

#[tokio::test]
async fn test_existing_dicom_files_are_uploaded_as_is() {
    let (addr, received) = spawn_archive(StatusCode::OK);
    let dir = tempfile::tempdir().unwrap();
    let subset = dir.path().join("stage_2_train_images");
    std::fs::create_dir_all(&subset).unwrap();
    let container = sample_container();
    for name in ["a.dcm", "b.dcm", "c.dcm"] {
        std::fs::write(subset.join(name), &container).unwrap();
    }

    let out = dir.path().join("out");
    let orchestrator = BatchOrchestrator::new(
        ContainerBuilder::new(),
        Arc::new(uploader(addr)),
        OrchestratorOptions::new(&out),
    );
    let selector = pacs_ingest::SubsetSample::new(vec!["stage_2_train_images".to_string()], 2);
    let report = orchestrator
        .run_selected(&selector, dir.path())
        .await
        .unwrap();

    assert_eq!(report.converted, 0);
    assert_eq!(report.skipped_conversion, 2);
    assert_eq!(report.upload_accepted, 2);
    assert_eq!(received.hits.load(Ordering::SeqCst), 2);
    // nothing is written for sources that already are DICOM
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
}
