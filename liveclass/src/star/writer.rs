//! cisTEM-format table serialization.

use super::{ParticleTable, StarError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// The fixed cisTEM classification field list, in column order.
///
/// Position-in-stack comes first and the class assignment last; everything
/// the classifier refines sits in between. `refine2d` expects exactly this
/// schema.
pub const CISTEM_FIELDS: [&str; 22] = [
    "_cisTEMPositionInStack",
    "_cisTEMAnglePsi",
    "_cisTEMXShift",
    "_cisTEMYShift",
    "_cisTEMDefocus1",
    "_cisTEMDefocus2",
    "_cisTEMDefocusAngle",
    "_cisTEMPhaseShift",
    "_cisTEMOccupancy",
    "_cisTEMLogP",
    "_cisTEMSigma",
    "_cisTEMScore",
    "_cisTEMScoreChange",
    "_cisTEMPixelSize",
    "_cisTEMMicroscopeVoltagekV",
    "_cisTEMMicroscopeCsMM",
    "_cisTEMAmplitudeContrast",
    "_cisTEMBeamTiltX",
    "_cisTEMBeamTiltY",
    "_cisTEMImageShiftX",
    "_cisTEMImageShiftY",
    "_cisTEMBest2DClass",
];

/// Producer-table columns the writer copies through.
const SOURCE_COLUMNS: [&str; 7] = [
    "rlnDefocusU",
    "rlnDefocusV",
    "rlnDefocusAngle",
    "rlnDetectorPixelSize",
    "rlnVoltage",
    "rlnSphericalAberration",
    "rlnAmplitudeContrast",
];

/// Serializes a producer table as a fresh cisTEM classification table.
///
/// Every row 1..len gets its stack position, the optics fields copied from
/// the producer export, and neutral sentinels for everything the classifier
/// will populate (zero shifts, occupancy 100, score 20, class 0 meaning
/// unclassified). Returns the number of rows written.
pub fn write_cistem_table(table: &ParticleTable, out_path: &Path) -> Result<usize, StarError> {
    for column in SOURCE_COLUMNS {
        if table.column_index(column).is_none() {
            return Err(StarError::MissingColumn {
                path: out_path.to_path_buf(),
                column: column.to_string(),
            });
        }
    }

    let out = File::create(out_path).map_err(|e| StarError::io(out_path, e))?;
    let mut out = BufWriter::new(out);

    let header: Vec<String> = CISTEM_FIELDS
        .iter()
        .enumerate()
        .map(|(index, field)| format!("{} #{}", field, index + 1))
        .collect();
    write!(out, " \ndata_\n \nloop_\n{}\n", header.join("\n"))
        .map_err(|e| StarError::io(out_path, e))?;

    for row in 0..table.len() {
        let field = |name: &str| table.value(row, name).unwrap_or("");
        // Warp writes pixel size with varying precision; normalize to 4 dp.
        let pixel_size = match field("rlnDetectorPixelSize").parse::<f64>() {
            Ok(v) => format!("{:.4}", v),
            Err(_) => field("rlnDetectorPixelSize").to_string(),
        };
        let fields = [
            (row + 1).to_string(),
            "0.00".to_string(),
            "-0.00".to_string(),
            "-0.00".to_string(),
            field("rlnDefocusU").to_string(),
            field("rlnDefocusV").to_string(),
            field("rlnDefocusAngle").to_string(),
            "0.0".to_string(),
            "100.0".to_string(),
            "-500".to_string(),
            "1.0".to_string(),
            "20.0".to_string(),
            "0.0".to_string(),
            pixel_size,
            field("rlnVoltage").to_string(),
            field("rlnSphericalAberration").to_string(),
            field("rlnAmplitudeContrast").to_string(),
            "0.0".to_string(),
            "0.0".to_string(),
            "0.0".to_string(),
            "0.0".to_string(),
            "0".to_string(),
        ];
        writeln!(out, "{}", fields.join("\t")).map_err(|e| StarError::io(out_path, e))?;
    }
    out.flush().map_err(|e| StarError::io(out_path, e))?;

    Ok(table.len())
}
