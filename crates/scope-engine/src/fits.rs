//! Minimal FITS header handling and observation-context enrichment.
//!
//! Captures arrive from the camera with capture-time intrinsic metadata
//! (DATE-OBS, EXPTIME, ...). Before upload the daemon adds the observation
//! context: site location, target, observer, telescope, filter, and the
//! task id for traceability. Only header cards are touched; pixel data is
//! copied through untouched.
//!
//! The handful of 80-byte-card primitives below is all this crate needs
//! from the format, so no external FITS dependency is pulled in.

use std::path::Path;

use anyhow::Context as _;

use crate::location::SensorLocation;

const BLOCK: usize = 2880;
const CARD: usize = 80;

/// Observation context written into a capture's header.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentContext {
    pub location: Option<SensorLocation>,
    /// Target name (OBJECT).
    pub object: Option<String>,
    /// Ground station name (OBSERVER).
    pub observer: Option<String>,
    /// Telescope name (TELESCOP).
    pub telescope: Option<String>,
    /// Filter name (FILTER), when one was assigned.
    pub filter: Option<String>,
    /// Task UUID (TASKID); also the idempotency sentinel.
    pub task_id: Option<String>,
}

/// A value for a FITS header card.
#[derive(Debug, Clone)]
enum CardValue {
    Logical(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

fn format_card(keyword: &str, value: &CardValue, comment: &str) -> [u8; CARD] {
    let value_part = match value {
        CardValue::Logical(true) => format!("{:>20}", "T"),
        CardValue::Logical(false) => format!("{:>20}", "F"),
        CardValue::Integer(v) => format!("{v:>20}"),
        CardValue::Real(v) => format!("{v:>20}"),
        // Single quotes in string values are escaped by doubling.
        CardValue::Text(v) => format!("'{:<8}'", v.replace('\'', "''")),
    };

    let mut card = format!("{keyword:<8}= {value_part}");
    if !comment.is_empty() {
        card.push_str(" / ");
        card.push_str(comment);
    }
    card.truncate(CARD);

    let mut out = [b' '; CARD];
    out[..card.len()].copy_from_slice(card.as_bytes());
    out
}

fn card_keyword(card: &[u8]) -> &str {
    std::str::from_utf8(&card[..8]).unwrap_or("").trim_end()
}

/// Split a FITS file into header cards (END exclusive) and the remaining
/// bytes after the header's block padding.
fn split_header(bytes: &[u8]) -> anyhow::Result<(Vec<[u8; CARD]>, &[u8])> {
    if bytes.len() < BLOCK || &bytes[..6] != b"SIMPLE" {
        anyhow::bail!("not a FITS file (missing SIMPLE card)");
    }

    let mut cards = Vec::new();
    let mut offset = 0;
    loop {
        if offset + CARD > bytes.len() {
            anyhow::bail!("FITS header has no END card");
        }
        let card: [u8; CARD] = bytes[offset..offset + CARD].try_into().expect("card slice");
        offset += CARD;
        if card_keyword(&card) == "END" {
            break;
        }
        cards.push(card);
    }

    // Header is padded with blank cards to a block boundary.
    let header_len = offset.div_ceil(BLOCK) * BLOCK;
    if header_len > bytes.len() {
        anyhow::bail!("truncated FITS header");
    }
    Ok((cards, &bytes[header_len..]))
}

fn assemble(cards: &[[u8; CARD]], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(cards.len() * CARD + CARD + BLOCK + data.len());
    for card in cards {
        out.extend_from_slice(card);
    }
    let mut end = [b' '; CARD];
    end[..3].copy_from_slice(b"END");
    out.extend_from_slice(&end);
    while out.len() % BLOCK != 0 {
        out.push(b' ');
    }
    out.extend_from_slice(data);
    out
}

/// True when the header already carries a TASKID card.
pub fn has_task_id(path: &Path) -> anyhow::Result<bool> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let (cards, _) = split_header(&bytes)?;
    Ok(cards.iter().any(|c| card_keyword(c) == "TASKID"))
}

/// Read a header card's raw value text, for tests and diagnostics.
pub fn header_value(path: &Path, keyword: &str) -> anyhow::Result<Option<String>> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let (cards, _) = split_header(&bytes)?;
    for card in &cards {
        if card_keyword(card) == keyword {
            let text = std::str::from_utf8(&card[10..]).unwrap_or("");
            let value = text.split(" / ").next().unwrap_or("").trim();
            return Ok(Some(value.trim_matches('\'').trim().to_string()));
        }
    }
    Ok(None)
}

/// Enrich a capture with observation context, in place (atomic rewrite).
///
/// Idempotent: a file already carrying this enrichment's TASKID card is
/// left untouched, so re-enrichment on upload retries is a no-op.
/// Failures here are logged by callers and never block an upload.
pub fn enrich_fits_metadata(path: &Path, ctx: &EnrichmentContext) -> anyhow::Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let (mut cards, data) = split_header(&bytes)?;

    if ctx.task_id.is_some() && cards.iter().any(|c| card_keyword(c) == "TASKID") {
        tracing::debug!(path = %path.display(), "capture already enriched (TASKID present)");
        return Ok(());
    }

    if let Some(loc) = &ctx.location {
        cards.push(format_card(
            "SITELAT",
            &CardValue::Real(loc.latitude),
            "Observatory latitude (deg)",
        ));
        cards.push(format_card(
            "SITELONG",
            &CardValue::Real(loc.longitude),
            "Observatory longitude (deg)",
        ));
        cards.push(format_card(
            "SITEELEV",
            &CardValue::Real(loc.altitude),
            "Observatory elevation (m)",
        ));
        cards.push(format_card(
            "LOCSRC",
            &CardValue::Text(loc.source.to_string()),
            "Location source",
        ));
    }
    if let Some(object) = &ctx.object {
        cards.push(format_card("OBJECT", &CardValue::Text(object.clone()), "Target name"));
    }
    if let Some(observer) = &ctx.observer {
        cards.push(format_card(
            "OBSERVER",
            &CardValue::Text(observer.clone()),
            "Ground station name",
        ));
    }
    if let Some(telescope) = &ctx.telescope {
        cards.push(format_card(
            "TELESCOP",
            &CardValue::Text(telescope.clone()),
            "Telescope name",
        ));
    }
    if let Some(filter) = &ctx.filter {
        cards.push(format_card("FILTER", &CardValue::Text(filter.clone()), "Filter name"));
    }
    if let Some(task_id) = &ctx.task_id {
        cards.push(format_card(
            "TASKID",
            &CardValue::Text(task_id.clone()),
            "Citra.space task UUID",
        ));
    }
    cards.push(format_card(
        "ORIGIN",
        &CardValue::Text("Citra.space".to_string()),
        "Data origin",
    ));

    let out = assemble(&cards, data);
    let tmp = path.with_extension("fits.tmp");
    std::fs::write(&tmp, out).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename over {}", path.display()))?;
    tracing::debug!(path = %path.display(), "enriched capture metadata");
    Ok(())
}

/// Read the pixel values of a 16-bit FITS image as unsigned counts.
///
/// FITS stores 16-bit data big-endian; cameras conventionally offset by
/// BZERO=32768 to represent unsigned wells. Raw card order beyond
/// BITPIX/NAXIS is not interpreted; this is for quality statistics, not
/// astrometry.
pub fn read_image_u16(path: &Path) -> anyhow::Result<Vec<u16>> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let (cards, data) = split_header(&bytes)?;

    let int_card = |key: &str| -> anyhow::Result<i64> {
        for card in &cards {
            if card_keyword(card) == key {
                let text = std::str::from_utf8(&card[10..]).unwrap_or("");
                let value = text.split('/').next().unwrap_or("").trim();
                return value.parse::<i64>().with_context(|| format!("bad {key} card"));
            }
        }
        anyhow::bail!("missing {key} card")
    };

    let bitpix = int_card("BITPIX")?;
    if bitpix != 16 {
        anyhow::bail!("unsupported BITPIX {bitpix} (expected 16)");
    }
    let width = int_card("NAXIS1")? as usize;
    let height = int_card("NAXIS2")? as usize;
    let pixel_count = width * height;
    if data.len() < pixel_count * 2 {
        anyhow::bail!("truncated FITS data section");
    }

    let bzero = 32768i32;
    Ok(data[..pixel_count * 2]
        .chunks_exact(2)
        .map(|pair| {
            let raw = i16::from_be_bytes([pair[0], pair[1]]) as i32;
            (raw + bzero).clamp(0, u16::MAX as i32) as u16
        })
        .collect())
}

/// Write a minimal valid 16-bit FITS image. Used by the simulated camera
/// and by tests.
pub fn write_minimal_fits(path: &Path, width: usize, height: usize) -> anyhow::Result<()> {
    let cards = vec![
        format_card("SIMPLE", &CardValue::Logical(true), "conforms to FITS standard"),
        format_card("BITPIX", &CardValue::Integer(16), "bits per pixel"),
        format_card("NAXIS", &CardValue::Integer(2), "number of axes"),
        format_card("NAXIS1", &CardValue::Integer(width as i64), ""),
        format_card("NAXIS2", &CardValue::Integer(height as i64), ""),
    ];

    let mut data = vec![0u8; width * height * 2];
    while data.len() % BLOCK != 0 {
        data.push(0);
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, assemble(&cards, &data))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
