//! Slice query and result payloads carried inside job and fragment envelopes.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

use crate::error::SliceError;

/// Shape of the storage fragments a worker reads the cube in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentShape {
    pub dim0: u32,
    pub dim1: u32,
    pub dim2: u32,
}

impl Default for FragmentShape {
    fn default() -> Self {
        Self {
            dim0: 64,
            dim1: 64,
            dim2: 64,
        }
    }
}

/// Job payload: one slice through a cube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceQuery {
    pub guid: String,
    pub dim: u32,
    pub lineno: u32,
    /// Bearer token, forwarded as received.
    pub token: String,
    pub storage_endpoint: String,
    pub shape: FragmentShape,
}

impl SliceQuery {
    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceShape {
    pub dim0: u32,
    pub dim1: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceLayout {
    pub chunk_size: u32,
    pub iterations: u32,
}

/// A run of samples and where it lands in the slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceTile {
    pub layout: SliceLayout,
    pub v: Vec<f32>,
}

/// Result payload. Each fragment carries a subset of the tiles; the
/// assembled response carries all of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SliceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_shape: Option<SliceShape>,
    #[serde(default)]
    pub tiles: Vec<SliceTile>,
}

impl SliceResponse {
    /// Decode fragments in sequence order and merge their tiles.
    ///
    /// Fragments may omit the shape; those that carry one must agree.
    pub fn from_fragments(fragments: &[Bytes]) -> Result<Self, SliceError> {
        let mut merged = SliceResponse::default();
        for (index, fragment) in fragments.iter().enumerate() {
            let part: SliceResponse = serde_json::from_slice(fragment)
                .map_err(|source| SliceError::Decode { index, source })?;
            match (merged.slice_shape, part.slice_shape) {
                (Some(have), Some(got)) if have != got => {
                    return Err(SliceError::ShapeMismatch {
                        index,
                        expected: have,
                        actual: got,
                    });
                }
                (None, Some(got)) => merged.slice_shape = Some(got),
                _ => {}
            }
            merged.tiles.extend(part.tiles);
        }
        Ok(merged)
    }

    /// Split into `count` parts with tiles spread evenly and in order.
    /// Every part carries the shape.
    pub fn split(self, count: usize) -> Vec<SliceResponse> {
        let count = count.max(1);
        let total = self.tiles.len();
        let mut tiles = self.tiles.into_iter();
        (0..count)
            .map(|i| {
                let take = (i + 1) * total / count - i * total / count;
                SliceResponse {
                    slice_shape: self.slice_shape,
                    tiles: tiles.by_ref().take(take).collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(chunk_size: u32, value: f32) -> SliceTile {
        SliceTile {
            layout: SliceLayout {
                chunk_size,
                iterations: 1,
            },
            v: vec![value; chunk_size as usize],
        }
    }

    fn encode(response: &SliceResponse) -> Bytes {
        Bytes::from(serde_json::to_vec(response).unwrap())
    }

    #[test]
    fn query_payload_shape() {
        let query = SliceQuery {
            guid: "cube-1".into(),
            dim: 0,
            lineno: 17,
            token: "Bearer abc".into(),
            storage_endpoint: "https://storage.example".into(),
            shape: FragmentShape::default(),
        };
        insta::assert_json_snapshot!("slice_query", query);
    }

    #[test]
    fn query_payload_parses_back() {
        let query = SliceQuery {
            guid: "cube-1".into(),
            dim: 2,
            lineno: 5,
            token: String::new(),
            storage_endpoint: String::new(),
            shape: FragmentShape::default(),
        };
        let payload = query.to_payload().unwrap();
        assert_eq!(SliceQuery::from_payload(&payload).unwrap(), query);
    }

    #[test]
    fn merges_tiles_in_fragment_order() {
        let shape = Some(SliceShape { dim0: 2, dim1: 3 });
        let first = SliceResponse {
            slice_shape: shape,
            tiles: vec![tile(2, 1.0)],
        };
        let second = SliceResponse {
            slice_shape: None,
            tiles: vec![tile(4, 2.0)],
        };

        let merged = SliceResponse::from_fragments(&[encode(&first), encode(&second)]).unwrap();
        assert_eq!(merged.slice_shape, shape);
        assert_eq!(merged.tiles, vec![tile(2, 1.0), tile(4, 2.0)]);
    }

    #[test]
    fn disagreeing_shapes_rejected() {
        let a = SliceResponse {
            slice_shape: Some(SliceShape { dim0: 2, dim1: 3 }),
            tiles: vec![],
        };
        let b = SliceResponse {
            slice_shape: Some(SliceShape { dim0: 3, dim1: 2 }),
            tiles: vec![],
        };

        let err = SliceResponse::from_fragments(&[encode(&a), encode(&b)]).unwrap_err();
        assert!(matches!(err, SliceError::ShapeMismatch { index: 1, .. }));
    }

    #[test]
    fn undecodable_fragment_reports_index() {
        let good = encode(&SliceResponse::default());
        let err = SliceResponse::from_fragments(&[good, Bytes::from_static(b"{oops")]).unwrap_err();
        assert!(matches!(err, SliceError::Decode { index: 1, .. }));
    }

    #[test]
    fn split_spreads_tiles_evenly() {
        let response = SliceResponse {
            slice_shape: Some(SliceShape { dim0: 1, dim1: 7 }),
            tiles: (0..7).map(|i| tile(1, i as f32)).collect(),
        };

        let parts = response.clone().split(3);
        let sizes: Vec<usize> = parts.iter().map(|p| p.tiles.len()).collect();
        assert_eq!(sizes, vec![2, 2, 3]);
        assert!(parts.iter().all(|p| p.slice_shape == response.slice_shape));

        let rejoined: Vec<SliceTile> = parts.into_iter().flat_map(|p| p.tiles).collect();
        assert_eq!(rejoined, response.tiles);
    }

    #[test]
    fn split_into_more_parts_than_tiles() {
        let response = SliceResponse {
            slice_shape: None,
            tiles: vec![tile(1, 0.0)],
        };
        let parts = response.split(4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts.iter().map(|p| p.tiles.len()).sum::<usize>(), 1);
    }
}
