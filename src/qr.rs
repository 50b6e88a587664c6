//! # QR Code Generation
//!
//! Produces the SVG QR code embedded in manual books. The primary path is a
//! remote rendering service; when it is unreachable (or returns something
//! that is not SVG) a locally drawn code is used instead, so a build never
//! fails on QR generation.
//!
//! Fallback order:
//!
//! 1. Remote service (`qr_endpoint` setting, 10 second timeout)
//! 2. Locally rendered QR grid with the escaped data as a caption
//! 3. Plain placeholder box with the escaped data (unencodable payloads)

use qrcode::QrCode;
use std::time::Duration;

use crate::error::LibritoError;
use crate::tokens::escape_html;

/// Requested size for remotely rendered codes.
const REMOTE_SIZE: &str = "300x300";

/// Timeout for the remote rendering request.
const REMOTE_TIMEOUT_SECS: u64 = 10;

/// Pixel size of locally rendered fallback codes.
const FALLBACK_SIZE: usize = 160;

/// Client for the remote QR rendering service with local fallbacks.
pub struct QrClient {
    http: reqwest::Client,
    endpoint: String,
}

impl QrClient {
    /// Create a client for the given service endpoint.
    pub fn new(endpoint: &str) -> Result<Self, LibritoError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("librito/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REMOTE_TIMEOUT_SECS))
            .build()
            .map_err(|e| LibritoError::Remote(format!("HTTP client error: {}", e)))?;
        Ok(QrClient {
            http,
            endpoint: endpoint.to_string(),
        })
    }

    /// Generate SVG markup encoding `data`.
    ///
    /// Never fails: remote errors fall back to a locally rendered code,
    /// and unencodable payloads fall back to a placeholder box. Every
    /// returned shape contains the escaped input text.
    pub async fn generate_svg(&self, data: &str) -> String {
        match self.fetch_remote(data).await {
            Ok(svg) => svg,
            Err(e) => {
                tracing::warn!(error = %e, "QR service unavailable, rendering locally");
                local_svg(data)
            }
        }
    }

    async fn fetch_remote(&self, data: &str) -> Result<String, LibritoError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("data", data), ("format", "svg"), ("size", REMOTE_SIZE)])
            .send()
            .await
            .map_err(|e| LibritoError::Remote(format!("QR request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(LibritoError::Remote(format!(
                "QR service returned HTTP {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| LibritoError::Remote(format!("Failed to read QR response: {}", e)))?;

        if !body.contains("<svg") {
            return Err(LibritoError::Remote(
                "QR service returned a non-SVG body".to_string(),
            ));
        }

        Ok(body)
    }
}

/// Render a QR code locally as SVG, captioned with the escaped data.
///
/// Falls back to [`placeholder_svg`] when the data cannot be encoded.
pub fn local_svg(data: &str) -> String {
    let code = match QrCode::new(data.as_bytes()) {
        Ok(code) => code,
        Err(e) => {
            tracing::warn!(error = %e, "QR data not encodable, using placeholder");
            return placeholder_svg(data);
        }
    };

    let modules = code.width();
    // Integer cell size, at least 1px per module
    let cell = (FALLBACK_SIZE / modules).max(1);
    let size = modules * cell;

    let mut rects = String::new();
    for y in 0..modules {
        for x in 0..modules {
            if code[(x, y)] == qrcode::Color::Dark {
                rects.push_str(&format!(
                    r#"<rect x="{}" y="{}" width="{}" height="{}"/>"#,
                    x * cell,
                    y * cell,
                    cell,
                    cell
                ));
            }
        }
    }

    format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
            r##"<rect width="{w}" height="{h}" fill="#ffffff"/>"##,
            r##"<g fill="#000000">{rects}</g>"##,
            "</svg>",
            r#"<div class="qr-caption">{caption}</div>"#
        ),
        w = size,
        h = size,
        rects = rects,
        caption = escape_html(data)
    )
}

/// Plain bordered box with the escaped data centered inside.
pub fn placeholder_svg(data: &str) -> String {
    format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="160" height="160" viewBox="0 0 160 160">"#,
            r##"<rect x="1" y="1" width="158" height="158" fill="#ffffff" stroke="#000000" stroke-width="2"/>"##,
            r#"<text x="80" y="84" font-size="10" text-anchor="middle">{}</text>"#,
            "</svg>"
        ),
        escape_html(data)
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_svg_contains_data_caption() {
        let svg = local_svg("https://example.com/manual/HW-001");
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("https://example.com/manual/HW-001"));
        assert!(svg.contains("<rect")); // actual modules drawn
    }

    #[test]
    fn test_local_svg_escapes_markup_in_data() {
        let svg = local_svg("<script>alert(1)</script>");
        assert!(!svg.contains("<script>"));
        assert!(svg.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_placeholder_for_unencodable_data() {
        // QR codes cap out below 3000 bytes; this cannot be encoded
        let huge = "x".repeat(4000);
        let svg = local_svg(&huge);
        assert!(svg.contains("<text"));
        assert!(!svg.contains("<g fill"));
    }

    #[test]
    fn test_placeholder_shape() {
        let svg = placeholder_svg("HW-001");
        assert!(svg.contains(r#"width="160""#));
        assert!(svg.contains("HW-001"));
    }

    #[tokio::test]
    async fn test_generate_falls_back_when_unreachable() {
        // Nothing listens on port 9; the request fails immediately
        let client = QrClient::new("http://127.0.0.1:9/").unwrap();
        let svg = client.generate_svg("HW-042").await;
        assert!(svg.contains("HW-042"));
        assert!(svg.starts_with("<svg"));
    }
}
