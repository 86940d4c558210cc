//! Sample metadata used to build a tortilla.
//!
//! A [`Sample`] names one source file plus its catalog metadata; a
//! [`Samples`] set is the validated writer input. Geospatial (`stac:*`) and
//! demographic (`rai:*`) vocabularies are carried as opaque typed columns;
//! the container core never interprets them beyond the centroid string.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tortilla_footer::{Value, ID_COLUMN, LENGTH_COLUMN, OFFSET_COLUMN};

use crate::error::TortillaError;

/// SpatioTemporal Asset Catalog descriptors for one raster sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Stac {
    pub crs: String,
    /// GDAL-convention geotransform
    /// (origin x, x res, x rot, origin y, y rot, y res).
    pub geotransform: [f64; 6],
    /// (rows, columns)
    pub raster_shape: (u64, u64),
    /// WKT `POINT (lon lat)` in EPSG:4326, if already computed.
    pub centroid: Option<String>,
    pub time_start: DateTime<Utc>,
    pub time_end: Option<DateTime<Utc>>,
}

impl Stac {
    pub fn new(
        crs: impl Into<String>,
        geotransform: [f64; 6],
        raster_shape: (u64, u64),
        time_start: DateTime<Utc>,
        time_end: Option<DateTime<Utc>>,
    ) -> Result<Self, TortillaError> {
        if let Some(end) = time_end {
            if time_start > end {
                return Err(TortillaError::InvalidMetadata(format!(
                    "invalid times: {time_start} > {end}"
                )));
            }
        }
        Ok(Self {
            crs: crs.into(),
            geotransform,
            raster_shape,
            centroid: None,
            time_start,
            time_end,
        })
    }

    pub fn with_centroid(mut self, centroid: impl Into<String>) -> Self {
        self.centroid = Some(centroid.into());
        self
    }
}

/// Demographic covariates for Responsible AI reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rai {
    pub populationdensity: Option<f64>,
    pub female: Option<f64>,
    pub womenreproducibleage: Option<f64>,
    pub children: Option<f64>,
    pub youth: Option<f64>,
    pub elderly: Option<f64>,
}

/// One source file plus its metadata row.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    pub path: PathBuf,
    pub stac: Option<Stac>,
    pub rai: Option<Rai>,
    /// Free-form user columns, carried through the footer as-is.
    pub extra: Vec<(String, Value)>,
}

impl Sample {
    /// Fails with `InvalidPath` when the source file does not exist.
    pub fn new(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, TortillaError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(TortillaError::InvalidPath(path));
        }
        Ok(Self {
            id: id.into(),
            path,
            stac: None,
            rai: None,
            extra: Vec::new(),
        })
    }

    pub fn with_stac(mut self, stac: Stac) -> Self {
        self.stac = Some(stac);
        self
    }

    pub fn with_rai(mut self, rai: Rai) -> Self {
        self.rai = Some(rai);
        self
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.push((name.into(), value.into()));
        self
    }

    /// Metadata row for the footer. The offset is a placeholder the writer
    /// fills once partitioning has assigned positions; the length is the
    /// current size of the source file.
    pub(crate) fn export_row(&self) -> Result<(Vec<(String, Value)>, u64), TortillaError> {
        let length = fs::metadata(&self.path)
            .map_err(|_| TortillaError::InvalidPath(self.path.clone()))?
            .len();

        let mut row: Vec<(String, Value)> = vec![
            (ID_COLUMN.to_string(), Value::Str(self.id.clone())),
            (OFFSET_COLUMN.to_string(), Value::I64(0)),
            (LENGTH_COLUMN.to_string(), Value::I64(length as i64)),
        ];

        if let Some(stac) = &self.stac {
            row.push(("stac:crs".to_string(), Value::Str(stac.crs.clone())));
            row.push((
                "stac:geotransform".to_string(),
                Value::F64List(stac.geotransform.to_vec()),
            ));
            row.push((
                "stac:raster_shape".to_string(),
                Value::I64List(vec![stac.raster_shape.0 as i64, stac.raster_shape.1 as i64]),
            ));
            row.push((
                "stac:time_start".to_string(),
                Value::I64(stac.time_start.timestamp()),
            ));
            if let Some(end) = stac.time_end {
                row.push(("stac:time_end".to_string(), Value::I64(end.timestamp())));
            }
            if let Some(centroid) = &stac.centroid {
                row.push(("stac:centroid".to_string(), Value::Str(centroid.clone())));
            }
        }

        if let Some(rai) = &self.rai {
            for (name, value) in [
                ("rai:populationdensity", rai.populationdensity),
                ("rai:female", rai.female),
                ("rai:womenreproducibleage", rai.womenreproducibleage),
                ("rai:children", rai.children),
                ("rai:youth", rai.youth),
                ("rai:elderly", rai.elderly),
            ] {
                if let Some(v) = value {
                    row.push((name.to_string(), Value::F64(v)));
                }
            }
        }

        for (name, value) in &self.extra {
            row.push((name.clone(), value.clone()));
        }

        Ok((row, length))
    }
}

/// The validated writer input: samples with unique ids and one shared
/// payload format.
#[derive(Debug, Clone)]
pub struct Samples {
    samples: Vec<Sample>,
    data_format: String,
}

impl Samples {
    pub fn new(
        samples: Vec<Sample>,
        data_format: impl Into<String>,
    ) -> Result<Self, TortillaError> {
        let mut seen = HashSet::new();
        for sample in &samples {
            if !seen.insert(sample.id.as_str()) {
                return Err(TortillaError::DuplicateId(sample.id.clone()));
            }
        }
        Ok(Self {
            samples,
            data_format: data_format.into(),
        })
    }

    pub fn data_format(&self) -> &str {
        &self.data_format
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Fill in missing centroids with a caller-supplied derivation (the
    /// core never reprojects rasters itself). `derive` runs only for
    /// samples that carry raster parameters but no centroid.
    pub fn derive_centroids<F>(mut self, derive: F) -> Self
    where
        F: Fn(&Stac) -> Option<String>,
    {
        for sample in &mut self.samples {
            if let Some(stac) = &mut sample.stac {
                if stac.centroid.is_none() {
                    stac.centroid = derive(stac);
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn stamped(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_missing_path_rejected() {
        let err = Sample::new("a", "/no/such/file.tif").unwrap_err();
        assert!(matches!(err, TortillaError::InvalidPath(_)));
    }

    #[test]
    fn test_time_order_validated() {
        let err = Stac::new(
            "EPSG:4326",
            [0.0, 1.0, 0.0, 0.0, 0.0, -1.0],
            (10, 10),
            stamped(2_000),
            Some(stamped(1_000)),
        )
        .unwrap_err();
        assert!(matches!(err, TortillaError::InvalidMetadata(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected() -> eyre::Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        let a = Sample::new("same", tmp.path())?;
        let b = Sample::new("same", tmp.path())?;
        let err = Samples::new(vec![a, b], "GTiff").unwrap_err();
        assert!(matches!(err, TortillaError::DuplicateId(_)));
        Ok(())
    }

    #[test]
    fn test_export_row_shape() -> eyre::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut tmp, &[0u8; 64])?;

        let stac = Stac::new(
            "EPSG:32633",
            [500000.0, 10.0, 0.0, 4649776.0, 0.0, -10.0],
            (256, 256),
            stamped(1_700_000_000),
            None,
        )?
        .with_centroid("POINT (15.0 42.0)");

        let sample = Sample::new("s1", tmp.path())?
            .with_stac(stac)
            .with_rai(Rai {
                children: Some(0.2),
                ..Rai::default()
            })
            .with_extra("cloud_cover", 0.35);

        let (row, length) = sample.export_row()?;
        assert_eq!(length, 64);

        let names: Vec<&str> = row.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                ID_COLUMN,
                OFFSET_COLUMN,
                LENGTH_COLUMN,
                "stac:crs",
                "stac:geotransform",
                "stac:raster_shape",
                "stac:time_start",
                "stac:centroid",
                "rai:children",
                "cloud_cover",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_derive_centroids_only_fills_gaps() -> eyre::Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        let with = Sample::new("a", tmp.path())?.with_stac(
            Stac::new("EPSG:4326", [0.0; 6], (1, 1), stamped(0), None)?
                .with_centroid("POINT (1 1)"),
        );
        let without = Sample::new("b", tmp.path())?
            .with_stac(Stac::new("EPSG:4326", [0.0; 6], (1, 1), stamped(0), None)?);

        let samples = Samples::new(vec![with, without], "GTiff")?
            .derive_centroids(|_| Some("POINT (9 9)".to_string()));

        let centroids: Vec<Option<String>> = samples
            .iter()
            .map(|s| s.stac.as_ref().unwrap().centroid.clone())
            .collect();
        assert_eq!(
            centroids,
            vec![
                Some("POINT (1 1)".to_string()),
                Some("POINT (9 9)".to_string())
            ]
        );
        Ok(())
    }
}
