//! mzML reader for MS2 spectra.
//!
//! Streams the document with `quick-xml` and keeps only spectra whose
//! `ms level` is 2. Binary arrays are base64, either 32- or 64-bit little
//! endian floats, optionally zlib compressed. Scan numbers come from the
//! `scan=N` token of the spectrum id, falling back to the 1-based position
//! of the spectrum in the run.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use entropy_search_core::models::{meta_keys, MetaValue, Peak, Spectrum};
use flate2::read::ZlibDecoder;
use quick_xml::events::{BytesStart, Event};

use super::{Collector, LoadOptions, Loaded};
use crate::error::SearchError;

const MS_LEVEL: &str = "MS:1000511";
const SELECTED_ION_MZ: &str = "MS:1000744";
const CHARGE_STATE: &str = "MS:1000041";
const SCAN_START_TIME: &str = "MS:1000016";
const POSITIVE_SCAN: &str = "MS:1000130";
const NEGATIVE_SCAN: &str = "MS:1000129";
const FLOAT_32: &str = "MS:1000521";
const FLOAT_64: &str = "MS:1000523";
const ZLIB: &str = "MS:1000574";
const MZ_ARRAY: &str = "MS:1000514";
const INTENSITY_ARRAY: &str = "MS:1000515";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayKind {
    Unknown,
    Mz,
    Intensity,
}

#[derive(Debug)]
struct BinaryArray {
    kind: ArrayKind,
    is_64_bit: bool,
    zlib: bool,
    encoded: String,
}

impl Default for BinaryArray {
    fn default() -> Self {
        Self {
            kind: ArrayKind::Unknown,
            is_64_bit: true,
            zlib: false,
            encoded: String::new(),
        }
    }
}

impl BinaryArray {
    fn decode(&self) -> Result<Vec<f64>, String> {
        let raw = STANDARD
            .decode(self.encoded.trim())
            .map_err(|e| format!("base64: {}", e))?;
        let bytes = if self.zlib {
            let mut out = Vec::with_capacity(raw.len() * 2);
            ZlibDecoder::new(raw.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| format!("zlib: {}", e))?;
            out
        } else {
            raw
        };

        if self.is_64_bit {
            if bytes.len() % 8 != 0 {
                return Err("64-bit array length is not a multiple of 8".to_string());
            }
            Ok(bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect())
        } else {
            if bytes.len() % 4 != 0 {
                return Err("32-bit array length is not a multiple of 4".to_string());
            }
            Ok(bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect())
        }
    }
}

#[derive(Debug, Default)]
struct SpectrumState {
    id: String,
    position: usize,
    ms_level: Option<u32>,
    precursor_mz: Option<f64>,
    charge: i32,
    retention_time: Option<f64>,
    ion_mode: Option<&'static str>,
    arrays: Vec<BinaryArray>,
}

impl SpectrumState {
    fn scan(&self) -> u32 {
        self.id
            .split_whitespace()
            .find_map(|t| t.strip_prefix("scan="))
            .and_then(|n| n.parse().ok())
            .unwrap_or(self.position as u32)
    }

    fn into_spectrum(self) -> Result<Spectrum, String> {
        let precursor_mz = self
            .precursor_mz
            .filter(|mz| mz.is_finite() && *mz > 0.0)
            .ok_or_else(|| "missing precursor m/z".to_string())?;

        let mut mzs = None;
        let mut intensities = None;
        for array in &self.arrays {
            match array.kind {
                ArrayKind::Mz => mzs = Some(array.decode()?),
                ArrayKind::Intensity => intensities = Some(array.decode()?),
                ArrayKind::Unknown => {}
            }
        }
        let mzs = mzs.ok_or_else(|| "missing m/z array".to_string())?;
        let intensities = intensities.ok_or_else(|| "missing intensity array".to_string())?;
        if mzs.len() != intensities.len() {
            return Err(format!(
                "m/z and intensity arrays differ in length ({} vs {})",
                mzs.len(),
                intensities.len()
            ));
        }

        let scan = self.scan();
        let peaks = mzs
            .into_iter()
            .zip(intensities)
            .map(|(mz, intensity)| Peak::new(mz, intensity))
            .collect();

        let mut metadata = BTreeMap::new();
        if let Some(mode) = self.ion_mode {
            metadata.insert(meta_keys::ION_MODE.to_string(), MetaValue::Text(mode.to_string()));
        }
        if !self.id.is_empty() {
            metadata.insert(meta_keys::NAME.to_string(), MetaValue::Text(self.id.clone()));
        }

        let spectrum = Spectrum::new(scan, precursor_mz, peaks)
            .with_id(self.id)
            .with_charge(self.charge)
            .with_retention_time(self.retention_time)
            .with_all_metadata(metadata);
        if spectrum.peaks().is_empty() {
            return Err("empty peak list".to_string());
        }
        Ok(spectrum)
    }
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn apply_cv_param(e: &BytesStart<'_>, spectrum: &mut SpectrumState, array: Option<&mut BinaryArray>) {
    let Some(accession) = attribute(e, b"accession") else {
        return;
    };
    let value = attribute(e, b"value").unwrap_or_default();

    if let Some(array) = array {
        match accession.as_str() {
            FLOAT_32 => array.is_64_bit = false,
            FLOAT_64 => array.is_64_bit = true,
            ZLIB => array.zlib = true,
            MZ_ARRAY => array.kind = ArrayKind::Mz,
            INTENSITY_ARRAY => array.kind = ArrayKind::Intensity,
            _ => {}
        }
        return;
    }

    match accession.as_str() {
        MS_LEVEL => spectrum.ms_level = value.trim().parse().ok(),
        SELECTED_ION_MZ => {
            if spectrum.precursor_mz.is_none() {
                spectrum.precursor_mz = value.trim().parse().ok();
            }
        }
        CHARGE_STATE => spectrum.charge = value.trim().parse().unwrap_or(0),
        SCAN_START_TIME => {
            let unit = attribute(e, b"unitName").unwrap_or_default();
            spectrum.retention_time = value.trim().parse::<f64>().ok().map(|t| {
                if unit.eq_ignore_ascii_case("minute") {
                    t * 60.0
                } else {
                    t
                }
            });
        }
        POSITIVE_SCAN => spectrum.ion_mode = Some("positive"),
        NEGATIVE_SCAN => spectrum.ion_mode = Some("negative"),
        _ => {}
    }
}

pub fn parse(path: &Path, bytes: &[u8], opts: &LoadOptions) -> Result<Loaded, SearchError> {
    let mut collector = Collector::new(path, opts);
    let mut reader = quick_xml::Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut position = 0usize;
    let mut current: Option<SpectrumState> = None;
    let mut array: Option<BinaryArray> = None;
    let mut in_binary = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"spectrum" => {
                    position += 1;
                    current = Some(SpectrumState {
                        id: attribute(&e, b"id").unwrap_or_default(),
                        position,
                        charge: 0,
                        ..Default::default()
                    });
                }
                b"binaryDataArray" if current.is_some() => array = Some(BinaryArray::default()),
                b"binary" => in_binary = array.is_some(),
                b"cvParam" => {
                    if let Some(spectrum) = current.as_mut() {
                        apply_cv_param(&e, spectrum, array.as_mut());
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"cvParam" {
                    if let Some(spectrum) = current.as_mut() {
                        apply_cv_param(&e, spectrum, array.as_mut());
                    }
                }
            }
            Ok(Event::Text(te)) if in_binary => {
                if let Some(array) = array.as_mut() {
                    array.encoded.push_str(&te.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"binary" => in_binary = false,
                b"binaryDataArray" => {
                    if let (Some(spectrum), Some(finished)) = (current.as_mut(), array.take()) {
                        spectrum.arrays.push(finished);
                    }
                }
                b"spectrum" => {
                    if let Some(spectrum) = current.take() {
                        if spectrum.ms_level == Some(2) {
                            let record = spectrum.position;
                            collector.push(record, spectrum.into_spectrum())?;
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SearchError::parse(
                    path,
                    format!("XML error at byte {}: {}", reader.buffer_position(), e),
                ))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(collector.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use std::io::Write;

    fn encode_f64(values: &[f64]) -> String {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        STANDARD.encode(bytes)
    }

    fn encode_f32_zlib(values: &[f32]) -> String {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&bytes).unwrap();
        STANDARD.encode(encoder.finish().unwrap())
    }

    fn document(ms2_arrays: (&str, &str, &str)) -> String {
        let (mz, intensity, float_params) = ms2_arrays;
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<mzML xmlns="http://psi.hupo.org/ms/mzml">
  <run id="run1">
    <spectrumList count="2">
      <spectrum index="0" id="controllerType=0 controllerNumber=1 scan=11" defaultArrayLength="1">
        <cvParam cvRef="MS" accession="MS:1000511" name="ms level" value="1"/>
        <binaryDataArrayList count="0"/>
      </spectrum>
      <spectrum index="1" id="controllerType=0 controllerNumber=1 scan=12" defaultArrayLength="2">
        <cvParam cvRef="MS" accession="MS:1000511" name="ms level" value="2"/>
        <cvParam cvRef="MS" accession="MS:1000130" name="positive scan" value=""/>
        <scanList count="1">
          <scan>
            <cvParam cvRef="MS" accession="MS:1000016" name="scan start time" value="1.5" unitName="minute"/>
          </scan>
        </scanList>
        <precursorList count="1">
          <precursor>
            <selectedIonList count="1">
              <selectedIon>
                <cvParam cvRef="MS" accession="MS:1000744" name="selected ion m/z" value="300.1"/>
                <cvParam cvRef="MS" accession="MS:1000041" name="charge state" value="1"/>
              </selectedIon>
            </selectedIonList>
          </precursor>
        </precursorList>
        <binaryDataArrayList count="2">
          <binaryDataArray encodedLength="0">
            {float_params}
            <cvParam cvRef="MS" accession="MS:1000514" name="m/z array"/>
            <binary>{mz}</binary>
          </binaryDataArray>
          <binaryDataArray encodedLength="0">
            {float_params}
            <cvParam cvRef="MS" accession="MS:1000515" name="intensity array"/>
            <binary>{intensity}</binary>
          </binaryDataArray>
        </binaryDataArrayList>
      </spectrum>
    </spectrumList>
  </run>
</mzML>
"#
        )
    }

    #[test]
    fn reads_ms2_spectra_only() {
        let xml = document((
            &encode_f64(&[100.0, 150.0]),
            &encode_f64(&[50.0, 100.0]),
            r#"<cvParam cvRef="MS" accession="MS:1000523" name="64-bit float"/>"#,
        ));
        let loaded = parse(Path::new("run.mzML"), xml.as_bytes(), &LoadOptions::default()).unwrap();
        assert_eq!(loaded.spectra.len(), 1);

        let s = &loaded.spectra[0];
        assert_eq!(s.scan(), 12);
        assert_eq!(s.precursor_mz(), 300.1);
        assert_eq!(s.charge(), 1);
        assert_eq!(s.retention_time(), Some(90.0));
        assert_eq!(s.ion_mode(), Some("positive"));
        assert_eq!(s.peaks(), &[Peak::new(100.0, 50.0), Peak::new(150.0, 100.0)]);
    }

    #[test]
    fn reads_zlib_32_bit_arrays() {
        let float_params = concat!(
            r#"<cvParam cvRef="MS" accession="MS:1000521" name="32-bit float"/>"#,
            r#"<cvParam cvRef="MS" accession="MS:1000574" name="zlib compression"/>"#
        );
        let xml = document((
            &encode_f32_zlib(&[100.5, 150.25]),
            &encode_f32_zlib(&[5.0, 10.0]),
            float_params,
        ));
        let loaded = parse(Path::new("run.mzML"), xml.as_bytes(), &LoadOptions::default()).unwrap();
        let s = &loaded.spectra[0];
        assert_eq!(s.peaks(), &[Peak::new(100.5, 5.0), Peak::new(150.25, 10.0)]);
    }

    #[test]
    fn mismatched_arrays_fail_the_record() {
        let xml = document((
            &encode_f64(&[100.0, 150.0]),
            &encode_f64(&[50.0]),
            r#"<cvParam cvRef="MS" accession="MS:1000523" name="64-bit float"/>"#,
        ));
        let err = parse(Path::new("run.mzML"), xml.as_bytes(), &LoadOptions::default()).unwrap_err();
        assert!(err.to_string().contains("record 2"), "{}", err);
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = parse(
            Path::new("run.mzML"),
            b"<mzML><run><spectrum></run>",
            &LoadOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SearchError::Parse { .. }));
    }
}
