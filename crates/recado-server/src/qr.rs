use qrcode::QrCode;
use qrcode::render::svg;

/// Renders a pairing payload as an SVG document the UI can inline.
pub(crate) fn render_qr_svg(payload: &str) -> Option<String> {
    let code = QrCode::new(payload.as_bytes())
        .inspect_err(|e| tracing::warn!(error = %e, "QR payload could not be encoded"))
        .ok()?;

    Some(
        code.render::<svg::Color<'_>>()
            .min_dimensions(256, 256)
            .quiet_zone(true)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_svg_document() {
        let svg = render_qr_svg("2@pairing-payload,abc,def").unwrap();
        assert!(svg.contains("<svg"));
    }
}
