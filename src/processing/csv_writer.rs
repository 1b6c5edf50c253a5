use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::roi::RoiSet;

/// Write columns to a CSV file with headers. Shorter columns leave empty cells.
pub fn write_csv<P: AsRef<Path>>(path: P, headers: &[&str], data: &[Vec<f64>]) -> io::Result<()> {
    if !headers.is_empty() && !data.is_empty() && headers.len() != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Headers count ({}) doesn't match data columns ({})",
                headers.len(),
                data.len()
            ),
        ));
    }

    let mut file = File::create(path)?;

    writeln!(file, "{}", headers.join(","))?;

    let n_rows = data.iter().map(|col| col.len()).max().unwrap_or(0);

    for i in 0..n_rows {
        let row: Vec<String> = data
            .iter()
            .map(|col| col.get(i).map_or_else(String::new, |v| format!("{v:.15e}")))
            .collect();
        writeln!(file, "{}", row.join(","))?;
    }

    Ok(())
}

/// Which per-ROI buffer to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoiColumn {
    Data,
    DataPinned,
    Simulated,
    SimulatedPinned,
}

/// Write one column per ROI next to a time column. ROIs with an empty buffer
/// are skipped.
pub fn write_roi_series<P: AsRef<Path>>(
    path: P,
    time_header: &str,
    times: &[f64],
    rois: &RoiSet,
    column: RoiColumn,
) -> io::Result<()> {
    let mut headers = vec![time_header];
    let mut data = vec![times.to_vec()];
    for roi in rois.iter() {
        let series = match column {
            RoiColumn::Data => &roi.data_vec,
            RoiColumn::DataPinned => &roi.data_vec_pinned,
            RoiColumn::Simulated => &roi.sim_vec,
            RoiColumn::SimulatedPinned => &roi.sim_vec_pinned,
        };
        if series.is_empty() {
            continue;
        }
        headers.push(&roi.name);
        data.push(series.clone());
    }
    write_csv(path, &headers, &data)
}

/// Write named series sharing one time column, e.g. the fitted series of a fit.
pub fn write_named_series<P: AsRef<Path>>(
    path: P,
    time_header: &str,
    times: &[f64],
    series: &[(String, Vec<f64>)],
) -> io::Result<()> {
    let mut headers = vec![time_header];
    headers.extend(series.iter().map(|(name, _)| name.as_str()));
    let mut data = vec![times.to_vec()];
    data.extend(series.iter().map(|(_, s)| s.clone()));
    write_csv(path, &headers, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roi::{Roi, RoiShape};
    use std::fs;

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let headers = &["x", "y", "z"];
        let data = vec![
            vec![1.0, 2.0, 3.0],
            vec![4.0, 5.0, 6.0],
            vec![7.0, 8.0],
        ];

        write_csv(&path, headers, &data).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "x,y,z");
        assert_eq!(lines.len(), 4);
        assert!(lines[3].ends_with(','));
    }

    #[test]
    fn header_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_csv(dir.path().join("bad.csv"), &["a"], &[vec![1.0], vec![2.0]]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn roi_series_skip_empty_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rois.csv");
        let mut rois = RoiSet::new();
        rois.add(Roi::new("All", RoiShape::All)).unwrap().sim_vec = vec![1.0, 0.5];
        rois.add(Roi::new("Empty", RoiShape::All)).unwrap();

        write_roi_series(&path, "t", &[0.0, 1.0], &rois, RoiColumn::Simulated).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().next(), Some("t,All"));
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn named_series_share_a_time_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fitted.csv");
        let series = vec![
            ("Bleached Square".to_string(), vec![0.0, 0.4]),
            ("Slice".to_string(), vec![0.9, 0.95]),
        ];
        write_named_series(&path, "t", &[0.0, 2.0], &series).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "t,Bleached Square,Slice");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with('2'));
    }
}
