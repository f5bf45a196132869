//! Merge parser intermediates into one canonical [`Dataset`]

use crate::error::ParseError;
use crate::model::{
    CycleSample, DataWindow, Dataset, ExportShape, InstrumentFamily, ProtocolStep, Tier,
};
use crate::well::WellId;
use std::collections::{BTreeMap, BTreeSet};

/// Placeholder sample label CFX writes when no name was entered
const GENERIC_SAMPLE_LABEL: &str = "SNP";

/// One dye's readings: well -> cycle -> value.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTable {
    /// Channel identifier as written by the instrument ("FAM", "HEX", ...)
    pub channel: String,
    /// File or sheet the table came from
    pub source: String,
    pub values: BTreeMap<WellId, BTreeMap<u32, f64>>,
}

impl ChannelTable {
    pub fn new(channel: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            source: source.into(),
            values: BTreeMap::new(),
        }
    }

    /// Record one reading. A second reading for the same well and cycle
    /// means the table is damaged.
    pub fn insert(&mut self, well: WellId, cycle: u32, value: f64) -> Result<(), ParseError> {
        let per_well = self.values.entry(well).or_default();
        if per_well.insert(cycle, value).is_some() {
            return Err(ParseError::malformed(
                &self.source,
                format!("duplicate {} reading for well {} at cycle {}", self.channel, well, cycle),
            ));
        }
        Ok(())
    }

    pub fn wells(&self) -> BTreeSet<WellId> {
        self.values.keys().copied().collect()
    }

    pub fn get(&self, well: WellId, cycle: u32) -> Option<f64> {
        self.values.get(&well).and_then(|c| c.get(&cycle)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(BTreeMap::is_empty)
    }
}

/// Per-well metadata from summary/end-point tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WellRecord {
    pub sample: Option<String>,
    pub call: Option<String>,
    pub content_type: Option<String>,
    /// End-point FAM value (ADSheet RFU1)
    pub fam: Option<f64>,
    /// End-point second-allele value (ADSheet RFU2)
    pub allele2: Option<f64>,
}

/// Everything one parser recovered from an upload.
#[derive(Debug, Clone)]
pub struct ParsedExport {
    pub instrument: String,
    pub family: InstrumentFamily,
    pub shape: ExportShape,
    pub tier: Option<Tier>,
    /// Name of the upload, for error messages
    pub source: String,
    pub fam: Option<ChannelTable>,
    pub allele2: Option<ChannelTable>,
    pub rox: Option<ChannelTable>,
    /// Second-allele channel name when no allele-2 table carries it
    pub allele2_dye: Option<String>,
    pub records: BTreeMap<WellId, WellRecord>,
    pub protocol_steps: Vec<ProtocolStep>,
    pub data_windows: Vec<DataWindow>,
}

impl ParsedExport {
    pub fn new(
        instrument: impl Into<String>,
        family: InstrumentFamily,
        shape: ExportShape,
        source: impl Into<String>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            family,
            shape,
            tier: None,
            source: source.into(),
            fam: None,
            allele2: None,
            rox: None,
            allele2_dye: None,
            records: BTreeMap::new(),
            protocol_steps: Vec::new(),
            data_windows: Vec::new(),
        }
    }

    pub fn record_mut(&mut self, well: WellId) -> &mut WellRecord {
        self.records.entry(well).or_default()
    }
}

fn check_well_sets(reference: &ChannelTable, other: &ChannelTable) -> Result<(), ParseError> {
    let expected = reference.wells();
    let actual = other.wells();
    if expected == actual {
        return Ok(());
    }
    Err(ParseError::WellMismatch {
        reference: reference.channel.clone(),
        channel: other.channel.clone(),
        missing: expected.difference(&actual).copied().collect(),
        unexpected: actual.difference(&expected).copied().collect(),
    })
}

/// Build the dataset from per-dye cycle tables.
///
/// With `strict_rox` the reference table must cover the same wells as FAM
/// (CFX tier 1 bundles). Otherwise a reading without a reference value
/// keeps `rox: None`.
fn series_samples(
    fam: &ChannelTable,
    allele2: &ChannelTable,
    rox: Option<&ChannelTable>,
    strict_rox: bool,
) -> Result<Vec<CycleSample>, ParseError> {
    check_well_sets(fam, allele2)?;
    if let Some(rox) = rox {
        if strict_rox {
            check_well_sets(fam, rox)?;
        } else {
            let uncovered = fam.wells().difference(&rox.wells()).count();
            if uncovered > 0 {
                log::warn!("{} wells have no {} readings", uncovered, rox.channel);
            }
        }
    }

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    for (well, cycles) in &fam.values {
        for (&cycle, &fam_value) in cycles {
            let Some(allele2_value) = allele2.get(*well, cycle) else {
                skipped += 1;
                continue;
            };
            samples.push(CycleSample {
                well: *well,
                cycle,
                fam: fam_value,
                allele2: allele2_value,
                rox: rox.and_then(|r| r.get(*well, cycle)),
            });
        }
    }
    if skipped > 0 {
        log::warn!(
            "Skipped {} {} readings without a matching {} reading",
            skipped,
            fam.channel,
            allele2.channel
        );
    }
    Ok(samples)
}

/// Build the single-cycle dataset from summary RFU values.
fn endpoint_samples(records: &BTreeMap<WellId, WellRecord>) -> Vec<CycleSample> {
    records
        .iter()
        .filter_map(|(well, r)| match (r.fam, r.allele2) {
            (Some(fam), Some(allele2)) => Some(CycleSample {
                well: *well,
                cycle: 1,
                fam,
                allele2,
                rox: None,
            }),
            _ => None,
        })
        .collect()
}

/// Keep sample names only when they say something.
pub fn meaningful_sample_names(
    records: &BTreeMap<WellId, WellRecord>,
) -> BTreeMap<WellId, String> {
    let names: BTreeMap<WellId, String> = records
        .iter()
        .filter_map(|(well, r)| {
            let name = r.sample.as_deref()?.trim();
            (!name.is_empty()).then(|| (*well, name.to_string()))
        })
        .collect();

    let all_generic = names.values().all(|n| n == GENERIC_SAMPLE_LABEL);
    let distinct: BTreeSet<&String> = names.values().collect();
    let one_shared_label = names.len() > 1 && distinct.len() == 1;
    if all_generic || one_shared_label {
        return BTreeMap::new();
    }
    names
}

fn text_map(
    records: &BTreeMap<WellId, WellRecord>,
    field: impl Fn(&WellRecord) -> Option<&String>,
) -> BTreeMap<WellId, String> {
    records
        .iter()
        .filter_map(|(well, r)| {
            let value = field(r)?.trim();
            (!value.is_empty()).then(|| (*well, value.to_string()))
        })
        .collect()
}

fn default_windows(cycles: &[u32]) -> Vec<DataWindow> {
    match (cycles.first(), cycles.last()) {
        (Some(&first), Some(&last)) if cycles.len() == 1 => vec![DataWindow {
            name: "End Point".to_string(),
            start_cycle: first,
            end_cycle: last,
        }],
        (Some(&first), Some(&last)) => vec![DataWindow {
            name: "Amplification".to_string(),
            start_cycle: first,
            end_cycle: last,
        }],
        _ => Vec::new(),
    }
}

/// Merge a parser's intermediate into the canonical dataset.
pub fn assemble(parsed: ParsedExport) -> Result<Dataset, ParseError> {
    let (samples, allele2_dye) = match (&parsed.fam, &parsed.allele2) {
        (Some(fam), Some(allele2)) => (
            series_samples(fam, allele2, parsed.rox.as_ref(), parsed.tier == Some(Tier::Tier1))?,
            allele2.channel.clone(),
        ),
        _ => (
            endpoint_samples(&parsed.records),
            parsed.allele2_dye.clone().unwrap_or_else(|| "HEX".to_string()),
        ),
    };

    if samples.is_empty() {
        return Err(ParseError::malformed(
            &parsed.source,
            "no wells with both FAM and second-allele readings",
        ));
    }

    let wells: Vec<WellId> = samples
        .iter()
        .map(|s| s.well)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let cycles: Vec<u32> = samples
        .iter()
        .map(|s| s.cycle)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let has_rox = samples.iter().any(|s| s.rox.is_some());

    let data_windows = if parsed.data_windows.is_empty() {
        default_windows(&cycles)
    } else {
        parsed.data_windows.clone()
    };

    let dataset = Dataset {
        instrument: parsed.instrument.clone(),
        family: parsed.family,
        shape: parsed.shape,
        tier: parsed.tier,
        allele2_dye,
        sample_names: meaningful_sample_names(&parsed.records),
        instrument_calls: text_map(&parsed.records, |r| r.call.as_ref()),
        content_types: text_map(&parsed.records, |r| r.content_type.as_ref()),
        wells,
        cycles,
        samples,
        has_rox,
        protocol_steps: parsed.protocol_steps,
        data_windows,
    };

    log::info!(
        "Assembled {} dataset: {} wells x {} cycles, second allele {}, reference dye {}",
        dataset.instrument,
        dataset.wells.len(),
        dataset.cycles.len(),
        dataset.allele2_dye,
        if dataset.has_rox { "present" } else { "absent" }
    );
    Ok(dataset)
}
