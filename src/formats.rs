//! Output formats for the scenes.

pub mod scene_json {
    //! JSON hand-off of a [`Scene`] to the rendering layer.
    //! Keys are camelCase. All coordinates are in the viewer frame of the target (Y-up,
    //! target at the origin), except `target` itself, which is the real-world coordinate.
    use std::fs::File;
    use std::io::{BufWriter, Write};
    use std::path::Path;

    use log::debug;
    use serde::Serialize;

    use crate::geometry::SurfaceMesh;
    use crate::scene::{EntityKind, Orientation, PlacedAnnotation, Scene, SceneBuilding, SkippedEntity};

    #[derive(Serialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct SceneDocument {
        asset: Asset,
        target: [f64; 3],
        range: f64,
        buildings: Vec<BuildingNode>,
        annotations: Vec<AnnotationNode>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        skipped: Vec<SkippedNode>,
    }

    impl From<&Scene> for SceneDocument {
        fn from(scene: &Scene) -> Self {
            Self {
                asset: Default::default(),
                target: scene.target,
                range: scene.range,
                buildings: scene.buildings.iter().map(BuildingNode::from).collect(),
                annotations: scene.annotations.iter().map(AnnotationNode::from).collect(),
                skipped: scene.skipped.iter().map(SkippedNode::from).collect(),
            }
        }
    }

    impl SceneDocument {
        /// Write the scene to a JSON file.
        pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
            let file_out = File::create(path.as_ref())?;
            self.to_writer(BufWriter::new(file_out))?;
            debug!("Wrote the scene to {:?}", path.as_ref());
            Ok(())
        }

        pub fn to_writer<W: Write>(&self, mut writer: W) -> Result<(), Box<dyn std::error::Error>> {
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
            Ok(())
        }
    }

    #[derive(Serialize, Debug)]
    #[serde(rename_all = "camelCase")]
    struct Asset {
        version: String,
        generator: String,
    }

    impl Default for Asset {
        fn default() -> Self {
            Self {
                version: String::from("1.0"),
                generator: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            }
        }
    }

    #[derive(Serialize, Debug)]
    #[serde(rename_all = "camelCase")]
    struct BuildingNode {
        id: String,
        measured_height: f64,
        meshes: Vec<MeshNode>,
    }

    impl From<&SceneBuilding> for BuildingNode {
        fn from(building: &SceneBuilding) -> Self {
            Self {
                id: building.id.clone(),
                measured_height: building.measured_height,
                meshes: building.meshes.iter().map(MeshNode::from).collect(),
            }
        }
    }

    /// Triangles of one surface. `positions` and `normals` are flattened `[x, y, z]`
    /// triples, `indices` are counter-clockwise triangles into them.
    #[derive(Serialize, Debug)]
    #[serde(rename_all = "camelCase")]
    struct MeshNode {
        surface_id: String,
        surface_type: String,
        positions: Vec<f32>,
        normals: Vec<f32>,
        indices: Vec<u32>,
    }

    impl From<&SurfaceMesh> for MeshNode {
        fn from(mesh: &SurfaceMesh) -> Self {
            Self {
                surface_id: mesh.surface_id.clone(),
                surface_type: mesh.surface_type.to_string(),
                positions: mesh.positions.iter().flatten().copied().collect(),
                normals: mesh.normals.iter().flatten().copied().collect(),
                indices: mesh.indices.clone(),
            }
        }
    }

    #[derive(Serialize, Debug)]
    #[serde(rename_all = "camelCase")]
    struct AnnotationNode {
        id: String,
        kind: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        owner_id: Option<String>,
        content: ContentNode,
        scale_with_viewer_distance: bool,
        scale_on_selection: bool,
        position: [f32; 3],
        /// `None` when the annotation faces the viewer.
        #[serde(skip_serializing_if = "Option::is_none")]
        pointing_direction: Option<[f32; 3]>,
    }

    #[derive(Serialize, Debug)]
    #[serde(tag = "type", rename_all = "camelCase")]
    enum ContentNode {
        Text { text: String, size: f64 },
    }

    impl From<&PlacedAnnotation> for AnnotationNode {
        fn from(annotation: &PlacedAnnotation) -> Self {
            let pointing_direction = match annotation.orientation {
                Orientation::FaceViewer => None,
                Orientation::Fixed(direction) => Some(direction),
            };
            Self {
                id: annotation.id.clone(),
                kind: annotation.kind.as_str(),
                owner_id: annotation.owner_id.clone(),
                content: ContentNode::Text {
                    text: annotation.text.clone(),
                    size: annotation.size,
                },
                scale_with_viewer_distance: annotation.scale_with_viewer_distance,
                scale_on_selection: annotation.scale_on_selection,
                position: annotation.position,
                pointing_direction,
            }
        }
    }

    #[derive(Serialize, Debug)]
    #[serde(rename_all = "camelCase")]
    struct SkippedNode {
        id: String,
        kind: &'static str,
        reason: String,
    }

    impl From<&SkippedEntity> for SkippedNode {
        fn from(skipped: &SkippedEntity) -> Self {
            let kind = match skipped.kind {
                EntityKind::Surface => "surface",
                EntityKind::Annotation => "annotation",
            };
            Self {
                id: skipped.id.clone(),
                kind,
                reason: skipped.reason.clone(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::{AnnotationKind, SurfaceType};

        fn scene() -> Scene {
            Scene {
                target: [1000.0, 2000.0, 0.0],
                range: 300.0,
                buildings: vec![SceneBuilding {
                    id: "b1".to_string(),
                    measured_height: 3.0,
                    meshes: vec![SurfaceMesh {
                        surface_id: "roof".to_string(),
                        surface_type: SurfaceType::RoofSurface,
                        positions: vec![[0.0, 3.0, 0.0], [1.0, 3.0, 0.0], [1.0, 3.0, -1.0]],
                        normals: vec![[0.0, 1.0, 0.0]; 3],
                        indices: vec![0, 1, 2],
                    }],
                }],
                annotations: vec![
                    PlacedAnnotation {
                        id: "b1#b1".to_string(),
                        kind: AnnotationKind::Building,
                        owner_id: Some("b1".to_string()),
                        text: "Test".to_string(),
                        size: 1.5,
                        scale_with_viewer_distance: true,
                        scale_on_selection: false,
                        position: [0.5, 4.0, -0.5],
                        orientation: Orientation::FaceViewer,
                    },
                    PlacedAnnotation {
                        id: "data#w1".to_string(),
                        kind: AnnotationKind::World,
                        owner_id: None,
                        text: "Bus stop".to_string(),
                        size: 2.0,
                        scale_with_viewer_distance: false,
                        scale_on_selection: false,
                        position: [10.0, 1.5, 10.0],
                        orientation: Orientation::Fixed([1.0, 0.0, 0.0]),
                    },
                ],
                skipped: vec![],
            }
        }

        #[test]
        fn test_scene_document() -> serde_json::Result<()> {
            let document = SceneDocument::from(&scene());
            let json = serde_json::to_value(&document)?;
            assert_eq!(json["target"], serde_json::json!([1000.0, 2000.0, 0.0]));
            assert!(json.get("skipped").is_none());

            let mesh = &json["buildings"][0]["meshes"][0];
            assert_eq!(mesh["surfaceType"], "RoofSurface");
            assert_eq!(mesh["positions"].as_array().map(|a| a.len()), Some(9));
            assert_eq!(mesh["indices"], serde_json::json!([0, 1, 2]));

            let roof = &json["annotations"][0];
            assert_eq!(roof["kind"], "building");
            assert_eq!(roof["ownerId"], "b1");
            assert_eq!(roof["content"]["type"], "text");
            assert_eq!(roof["content"]["text"], "Test");
            assert_eq!(roof["scaleWithViewerDistance"], true);
            assert!(roof.get("pointingDirection").is_none());

            let world = &json["annotations"][1];
            assert!(world.get("ownerId").is_none());
            assert_eq!(world["pointingDirection"], serde_json::json!([1.0, 0.0, 0.0]));
            Ok(())
        }

        #[test]
        fn test_to_writer() {
            let mut out: Vec<u8> = Vec::new();
            SceneDocument::from(&scene()).to_writer(&mut out).unwrap();
            let text = String::from_utf8(out).unwrap();
            assert!(text.contains("\"measuredHeight\": 3.0"));
            assert!(text.contains("\"generator\": \"gmlanchor"));
        }
    }
}
