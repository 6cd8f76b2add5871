//! Integration tests for the image service client
//!
//! These tests require a running image service.
//! Set IMAGE_SERVICE_URL, IMAGE_SERVICE_TOKEN and TEST_IMAGE_ID to run.

use image_service_client::{ImageServiceClient, ImageServiceTrait};

fn client_from_env() -> ImageServiceClient {
    let url = std::env::var("IMAGE_SERVICE_URL")
        .unwrap_or_else(|_| "http://localhost:9292".to_string());
    let token = std::env::var("IMAGE_SERVICE_TOKEN").ok();
    ImageServiceClient::new(url, token).expect("Failed to create client")
}

#[tokio::test]
#[ignore] // Requires running image service
async fn test_show_image() {
    let client = client_from_env();
    let image_id = std::env::var("TEST_IMAGE_ID")
        .expect("TEST_IMAGE_ID environment variable must be set");

    let image = client.show(&image_id).await.expect("Failed to show image");
    assert_eq!(image.id, image_id);
    println!("Image {} kernel_id={:?}", image.id, image.property_str("kernel_id"));
}

#[tokio::test]
#[ignore]
async fn test_download_image() {
    let client = client_from_env();
    let image_id = std::env::var("TEST_IMAGE_ID")
        .expect("TEST_IMAGE_ID environment variable must be set");
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let dest = dir.path().join("image");

    let written = client.download(&image_id, &dest).await.expect("Failed to download image");
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), written);
}
