// cifti.rs
//
// Minimal CIFTI-2 support: the NIfTI-2 header, the CIFTI XML extension and the
// 2D data matrix. Only what the pipeline needs to validate scans, read atlas
// label tables and load parcellated series.

use byteordered::{ByteOrdered, Endianness};
use log::debug;
use ndarray::{Array2, ShapeBuilder};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

pub const NIFTI2_HEADER_SIZE: usize = 540;
pub const CIFTI_EXTENSION_CODE: i32 = 32;
const NIFTI2_MAGIC: &[u8; 8] = b"n+2\0\r\n\x1a\n";

// --- Custom Error Type for this Module ---
#[derive(Debug)]
pub struct CiftiError(String);

impl std::fmt::Display for CiftiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CIFTI error: {}", self.0)
    }
}

impl std::error::Error for CiftiError {}

impl From<String> for CiftiError {
    fn from(s: String) -> Self { CiftiError(s) }
}
impl From<&str> for CiftiError {
    fn from(s: &str) -> Self { CiftiError(s.to_string()) }
}
impl From<std::io::Error> for CiftiError {
    fn from(e: std::io::Error) -> Self {
        CiftiError(format!("I/O error: {}", e))
    }
}
impl From<roxmltree::Error> for CiftiError {
    fn from(e: roxmltree::Error) -> Self {
        CiftiError(format!("XML error: {}", e))
    }
}

/// CIFTI-2 intent codes stored in the NIfTI-2 `intent_code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiftiIntent {
    DenseSeries,
    ParcellatedSeries,
    DenseScalars,
    DenseLabels,
    ParcellatedScalars,
    Other(i32),
}

impl CiftiIntent {
    pub fn from_code(code: i32) -> Self {
        match code {
            3002 => CiftiIntent::DenseSeries,
            3004 => CiftiIntent::ParcellatedSeries,
            3006 => CiftiIntent::DenseScalars,
            3007 => CiftiIntent::DenseLabels,
            3008 => CiftiIntent::ParcellatedScalars,
            other => CiftiIntent::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            CiftiIntent::DenseSeries => 3002,
            CiftiIntent::ParcellatedSeries => 3004,
            CiftiIntent::DenseScalars => 3006,
            CiftiIntent::DenseLabels => 3007,
            CiftiIntent::ParcellatedScalars => 3008,
            CiftiIntent::Other(code) => code,
        }
    }
}

/// The subset of the NIfTI-2 header needed to locate and decode the matrix.
#[derive(Debug, Clone)]
pub struct Nifti2Header {
    pub endianness: Endianness,
    pub datatype: i16,
    pub bitpix: i16,
    pub dim: [i64; 8],
    pub vox_offset: i64,
    pub scl_slope: f64,
    pub scl_inter: f64,
    pub intent_code: i32,
    pub intent_name: String,
}

impl Nifti2Header {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, CiftiError> {
        if buf.len() < NIFTI2_HEADER_SIZE {
            return Err(CiftiError::from(format!(
                "header is {} bytes, expected {}",
                buf.len(),
                NIFTI2_HEADER_SIZE
            )));
        }
        let size_bytes = [buf[0], buf[1], buf[2], buf[3]];
        let endianness = if i32::from_le_bytes(size_bytes) == NIFTI2_HEADER_SIZE as i32 {
            Endianness::Little
        } else if i32::from_be_bytes(size_bytes) == NIFTI2_HEADER_SIZE as i32 {
            Endianness::Big
        } else {
            return Err(CiftiError::from("sizeof_hdr is not 540, not a NIfTI-2 file"));
        };
        if &buf[4..12] != NIFTI2_MAGIC {
            return Err(CiftiError::from("missing NIfTI-2 magic 'n+2'"));
        }

        let mut fields = ByteOrdered::runtime(&buf[12..], endianness);
        let datatype = fields.read_i16()?;
        let bitpix = fields.read_i16()?;
        let mut dim = [0i64; 8];
        for d in dim.iter_mut() {
            *d = fields.read_i64()?;
        }
        // intent_p1..p3 and pixdim[8]
        for _ in 0..11 {
            fields.read_f64()?;
        }
        let vox_offset = fields.read_i64()?;
        let scl_slope = fields.read_f64()?;
        let scl_inter = fields.read_f64()?;

        let intent_code = ByteOrdered::runtime(&buf[504..508], endianness).read_i32()?;
        let intent_name = String::from_utf8_lossy(&buf[508..524])
            .trim_end_matches('\0')
            .to_string();

        Ok(Self {
            endianness,
            datatype,
            bitpix,
            dim,
            vox_offset,
            scl_slope,
            scl_inter,
            intent_code,
            intent_name,
        })
    }

    pub fn intent(&self) -> CiftiIntent {
        CiftiIntent::from_code(self.intent_code)
    }

    /// Matrix shape as (rows, columns) = (dim[5], dim[6]).
    pub fn matrix_shape(&self) -> Result<(usize, usize), CiftiError> {
        if self.dim[0] < 6 {
            return Err(CiftiError::from(format!(
                "dim[0] = {}, a CIFTI matrix needs at least 6 dimensions",
                self.dim[0]
            )));
        }
        if self.dim[1..5].iter().any(|&d| d != 1) {
            return Err(CiftiError::from(format!(
                "spatial dimensions must be 1 in a CIFTI file, found {:?}",
                &self.dim[1..5]
            )));
        }
        let rows = self.dim[5];
        let cols = self.dim[6];
        if rows < 0 || cols < 0 {
            return Err(CiftiError::from(format!("negative matrix dimensions {}x{}", rows, cols)));
        }
        Ok((rows as usize, cols as usize))
    }

    /// Byte offset of the data block, checked against the file length.
    fn data_start(&self, file_len: u64) -> Result<usize, CiftiError> {
        let start = u64::try_from(self.vox_offset)
            .ok()
            .filter(|&start| start <= file_len)
            .ok_or_else(|| {
                CiftiError::from(format!(
                    "vox_offset {} lies outside the {}-byte file",
                    self.vox_offset, file_len
                ))
            })?;
        usize::try_from(start).map_err(|_| CiftiError::from("vox_offset does not fit in memory"))
    }

    fn bytes_per_value(&self) -> Result<usize, CiftiError> {
        match self.datatype {
            2 | 256 => Ok(1),
            4 | 512 => Ok(2),
            8 | 16 | 768 => Ok(4),
            64 => Ok(8),
            other => Err(CiftiError::from(format!("unsupported NIfTI datatype code {}", other))),
        }
    }
}

/// A CIFTI-2 file opened for reading: header plus the XML extension.
///
/// Opening only reads the header and extensions; the (possibly large) data
/// block is read on demand by [`CiftiFile::read_matrix`].
#[derive(Debug, Clone)]
pub struct CiftiFile {
    pub header: Nifti2Header,
    pub xml: String,
}

impl CiftiFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CiftiError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut header_bytes = vec![0u8; NIFTI2_HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;
        let header = Nifti2Header::from_bytes(&header_bytes)?;

        let data_start = header.data_start(file_len)?;
        if data_start < NIFTI2_HEADER_SIZE + 4 {
            return Err(CiftiError::from(format!(
                "vox_offset {} leaves no room for the CIFTI extension",
                header.vox_offset
            )));
        }
        let mut extension_bytes = vec![0u8; data_start - NIFTI2_HEADER_SIZE];
        reader.read_exact(&mut extension_bytes)?;
        if extension_bytes[0] == 0 {
            return Err(CiftiError::from("file has no NIfTI extensions, not a CIFTI-2 file"));
        }

        let xml = find_cifti_extension(&extension_bytes[4..], header.endianness)?;
        debug!(
            "Opened CIFTI file {} (intent {} '{}', dims {:?}, {} bytes of XML)",
            path.display(),
            header.intent_code,
            header.intent_name,
            &header.dim[..7],
            xml.len()
        );
        Ok(Self { header, xml })
    }

    pub fn intent(&self) -> CiftiIntent {
        self.header.intent()
    }

    /// Loads the data matrix as (dim[5] rows x dim[6] columns), applying the
    /// header scaling. For series files rows are time points.
    pub fn read_matrix<P: AsRef<Path>>(&self, path: P) -> Result<Array2<f64>, CiftiError> {
        let (rows, cols) = self.header.matrix_shape()?;
        let width = self.header.bytes_per_value()?;
        if self.header.bitpix as usize != width * 8 {
            return Err(CiftiError::from(format!(
                "bitpix {} does not match datatype {}",
                self.header.bitpix, self.header.datatype
            )));
        }
        let file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        let data_start = self.header.data_start(file_len)?;
        let byte_len = rows
            .checked_mul(cols)
            .and_then(|n| n.checked_mul(width))
            .ok_or_else(|| CiftiError::from(format!("matrix {}x{} is too large", rows, cols)))?;
        let available = file_len - data_start as u64;
        if byte_len as u64 > available {
            return Err(CiftiError::from(format!(
                "matrix {}x{} needs {} bytes but only {} follow vox_offset",
                rows, cols, byte_len, available
            )));
        }
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(data_start as u64))?;
        let mut raw = vec![0u8; byte_len];
        reader.read_exact(&mut raw)?;

        let values = decode_values(&raw, self.header.datatype, self.header.endianness, rows * cols)?;
        let (slope, inter) = match (self.header.scl_slope, self.header.scl_inter) {
            (s, i) if s != 0.0 && s.is_finite() && i.is_finite() => (s, i),
            _ => (1.0, 0.0),
        };
        let values: Vec<f64> = if slope == 1.0 && inter == 0.0 {
            values
        } else {
            values.into_iter().map(|v| v * slope + inter).collect()
        };

        // NIfTI index order: dim[5] varies fastest, i.e. column-major in (rows, cols).
        Array2::from_shape_vec((rows, cols).f(), values)
            .map_err(|e| CiftiError::from(format!("matrix shape error: {}", e)))
    }
}

fn find_cifti_extension(mut bytes: &[u8], endianness: Endianness) -> Result<String, CiftiError> {
    while bytes.len() >= 8 {
        let mut fields = ByteOrdered::runtime(&bytes[..8], endianness);
        let esize = fields.read_i32()?;
        let ecode = fields.read_i32()?;
        if esize < 8 || esize as usize > bytes.len() {
            return Err(CiftiError::from(format!("corrupt NIfTI extension size {}", esize)));
        }
        if ecode == CIFTI_EXTENSION_CODE {
            let content = &bytes[8..esize as usize];
            let text = String::from_utf8_lossy(content);
            return Ok(text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace()).to_string());
        }
        bytes = &bytes[esize as usize..];
    }
    Err(CiftiError::from("no CIFTI-2 XML extension (code 32) found"))
}

fn decode_values(
    raw: &[u8],
    datatype: i16,
    endianness: Endianness,
    count: usize,
) -> Result<Vec<f64>, CiftiError> {
    let mut values = Vec::with_capacity(count);
    let mut rd = ByteOrdered::runtime(raw, endianness);
    for _ in 0..count {
        let v = match datatype {
            2 => rd.read_u8()? as f64,
            256 => rd.read_i8()? as f64,
            4 => rd.read_i16()? as f64,
            512 => rd.read_u16()? as f64,
            8 => rd.read_i32()? as f64,
            768 => rd.read_u32()? as f64,
            16 => rd.read_f32()? as f64,
            64 => rd.read_f64()?,
            other => {
                return Err(CiftiError::from(format!("unsupported NIfTI datatype code {}", other)))
            }
        };
        values.push(v);
    }
    Ok(values)
}

/// Reads the first label table of a `CIFTI_INDEX_TYPE_LABELS` map as
/// (key, name) pairs in file order.
pub fn parse_label_table(xml: &str) -> Result<Vec<(i32, String)>, CiftiError> {
    let doc = roxmltree::Document::parse(xml)?;
    let label_map = doc
        .descendants()
        .filter(|n| n.has_tag_name("MatrixIndicesMap"))
        .find(|n| n.attribute("IndicesMapToDataType") == Some("CIFTI_INDEX_TYPE_LABELS"))
        .ok_or_else(|| CiftiError::from("no CIFTI_INDEX_TYPE_LABELS index map"))?;
    let table = label_map
        .descendants()
        .find(|n| n.has_tag_name("LabelTable"))
        .ok_or_else(|| CiftiError::from("label index map has no LabelTable"))?;

    let mut labels = Vec::new();
    for label in table.children().filter(|n| n.has_tag_name("Label")) {
        let key = label
            .attribute("Key")
            .ok_or_else(|| CiftiError::from("Label element without a Key attribute"))?
            .trim()
            .parse::<i32>()
            .map_err(|e| CiftiError::from(format!("bad label key: {}", e)))?;
        let name = label.text().unwrap_or("").trim().to_string();
        labels.push((key, name));
    }
    Ok(labels)
}

/// Parcel names of the `CIFTI_INDEX_TYPE_PARCELS` map, in matrix column order.
pub fn parse_parcel_names(xml: &str) -> Result<Vec<String>, CiftiError> {
    let doc = roxmltree::Document::parse(xml)?;
    let parcel_map = doc
        .descendants()
        .filter(|n| n.has_tag_name("MatrixIndicesMap"))
        .find(|n| n.attribute("IndicesMapToDataType") == Some("CIFTI_INDEX_TYPE_PARCELS"))
        .ok_or_else(|| CiftiError::from("no CIFTI_INDEX_TYPE_PARCELS index map"))?;
    Ok(parcel_map
        .children()
        .filter(|n| n.has_tag_name("Parcel"))
        .map(|n| n.attribute("Name").unwrap_or("").to_string())
        .collect())
}

/// Index map types declared in the XML, e.g. `CIFTI_INDEX_TYPE_SERIES`.
pub fn index_map_types(xml: &str) -> Result<Vec<String>, CiftiError> {
    let doc = roxmltree::Document::parse(xml)?;
    Ok(doc
        .descendants()
        .filter(|n| n.has_tag_name("MatrixIndicesMap"))
        .filter_map(|n| n.attribute("IndicesMapToDataType").map(str::to_string))
        .collect())
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Writers for small synthetic CIFTI-2 files used across the test suites.

    use super::*;

    pub(crate) fn label_xml(labels: &[(i32, &str)]) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<CIFTI Version=\"2\"><Matrix>\
             <MatrixIndicesMap AppliesToMatrixDimension=\"0\" IndicesMapToDataType=\"CIFTI_INDEX_TYPE_LABELS\">\
             <NamedMap><MapName>atlas</MapName><LabelTable>",
        );
        for (key, name) in labels {
            xml.push_str(&format!(
                "<Label Key=\"{}\" Red=\"0.5\" Green=\"0.5\" Blue=\"0.5\" Alpha=\"1\">{}</Label>",
                key, name
            ));
        }
        xml.push_str(
            "</LabelTable></NamedMap></MatrixIndicesMap>\
             <MatrixIndicesMap AppliesToMatrixDimension=\"1\" IndicesMapToDataType=\"CIFTI_INDEX_TYPE_BRAIN_MODELS\"/>\
             </Matrix></CIFTI>",
        );
        xml
    }

    pub(crate) fn parcel_series_xml(parcels: &[&str], timepoints: usize) -> String {
        let mut xml = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<CIFTI Version=\"2\"><Matrix>\
             <MatrixIndicesMap AppliesToMatrixDimension=\"0\" IndicesMapToDataType=\"CIFTI_INDEX_TYPE_SERIES\" \
             NumberOfSeriesPoints=\"{}\" SeriesExponent=\"0\" SeriesStart=\"0\" SeriesStep=\"0.72\" SeriesUnit=\"SECOND\"/>\
             <MatrixIndicesMap AppliesToMatrixDimension=\"1\" IndicesMapToDataType=\"CIFTI_INDEX_TYPE_PARCELS\">",
            timepoints
        );
        for name in parcels {
            xml.push_str(&format!("<Parcel Name=\"{}\"/>", name));
        }
        xml.push_str("</MatrixIndicesMap></Matrix></CIFTI>");
        xml
    }

    pub(crate) fn dense_series_xml(timepoints: usize) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<CIFTI Version=\"2\"><Matrix>\
             <MatrixIndicesMap AppliesToMatrixDimension=\"0\" IndicesMapToDataType=\"CIFTI_INDEX_TYPE_SERIES\" \
             NumberOfSeriesPoints=\"{}\" SeriesExponent=\"0\" SeriesStart=\"0\" SeriesStep=\"0.72\" SeriesUnit=\"SECOND\"/>\
             <MatrixIndicesMap AppliesToMatrixDimension=\"1\" IndicesMapToDataType=\"CIFTI_INDEX_TYPE_BRAIN_MODELS\"/>\
             </Matrix></CIFTI>",
            timepoints
        )
    }

    /// Writes a little-endian float32 CIFTI-2 file. `data` is (rows x cols).
    pub(crate) fn write_cifti(path: &Path, intent: CiftiIntent, xml: &str, data: &Array2<f64>) {
        let (rows, cols) = data.dim();
        let mut xml_bytes = xml.as_bytes().to_vec();
        while (xml_bytes.len() + 8) % 16 != 0 {
            xml_bytes.push(0);
        }
        let esize = (xml_bytes.len() + 8) as i32;
        let vox_offset = (NIFTI2_HEADER_SIZE + 4) as i64 + esize as i64;

        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&(NIFTI2_HEADER_SIZE as i32).to_le_bytes());
        buf.extend_from_slice(NIFTI2_MAGIC);
        buf.extend_from_slice(&16i16.to_le_bytes());
        buf.extend_from_slice(&32i16.to_le_bytes());
        for d in [6i64, 1, 1, 1, 1, rows as i64, cols as i64, 1] {
            buf.extend_from_slice(&d.to_le_bytes());
        }
        for _ in 0..3 {
            buf.extend_from_slice(&0f64.to_le_bytes());
        }
        for _ in 0..8 {
            buf.extend_from_slice(&1f64.to_le_bytes());
        }
        buf.extend_from_slice(&vox_offset.to_le_bytes());
        buf.extend_from_slice(&1f64.to_le_bytes());
        buf.extend_from_slice(&0f64.to_le_bytes());
        // cal_max, cal_min, slice_duration, toffset, slice_start, slice_end
        buf.extend_from_slice(&[0u8; 6 * 8]);
        // descrip, aux_file, qform_code, sform_code, quatern/qoffset, srow_*, slice_code, xyzt_units
        buf.extend_from_slice(&[0u8; 80 + 24 + 4 + 4 + 6 * 8 + 12 * 8 + 4 + 4]);
        buf.extend_from_slice(&intent.code().to_le_bytes());
        let mut intent_name = [0u8; 16];
        intent_name[..9].copy_from_slice(b"ConnDense");
        buf.extend_from_slice(&intent_name);
        buf.extend_from_slice(&[0u8; 16]);
        assert_eq!(buf.len(), NIFTI2_HEADER_SIZE);

        buf.extend_from_slice(&[1u8, 0, 0, 0]);
        buf.extend_from_slice(&esize.to_le_bytes());
        buf.extend_from_slice(&CIFTI_EXTENSION_CODE.to_le_bytes());
        buf.extend_from_slice(&xml_bytes);
        for c in 0..cols {
            for r in 0..rows {
                buf.extend_from_slice(&(data[[r, c]] as f32).to_le_bytes());
            }
        }
        std::fs::write(path, buf).unwrap();
    }
}
