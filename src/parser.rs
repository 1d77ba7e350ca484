//! Streaming CityGML reader.
//!
//! Reads `bldg:Building` and `bldg:BuildingPart` elements with their LoD1 or LoD2
//! geometry, the dataset envelope and the annotations of the `annotation` extension
//! namespace. Elements are matched on their local name, so the namespace prefixes of a
//! file do not matter.
//!
//! A building that cannot be read is logged and skipped, the rest of the file is still
//! read. Broken XML fails the whole file.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use rayon::prelude::*;
use thiserror::Error;

use crate::model::{
    AnnotationContent, AnnotationProperties, Building, BuildingAnnotation, Surface,
    SurfaceAnnotation, SurfaceType, WorldCoordinateAnnotation,
};
use crate::spatial_structs::{BoundingBox, Point3};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Could not read the file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("Invalid XML attribute: {0}")]
    Attribute(#[from] AttrError),
    #[error("The document ended inside <{0}>")]
    UnexpectedEof(String),
    #[error("Building {0} does not contain a measuredHeight")]
    MissingHeight(String),
    #[error("Unknown LOD: building {0} has neither a lod1Solid nor a lod2Solid")]
    UnknownLod(String),
    #[error("Could not parse <{element}> value '{value}' as a number")]
    MalformedNumber { element: String, value: String },
    #[error("Coordinates could not be parsed: '{0}'")]
    MalformedCoordinates(String),
    #[error("The envelope does not contain a <{0}>")]
    MissingEnvelopeCorner(&'static str),
    #[error("<{element}> is missing in {context}")]
    MissingElement {
        element: &'static str,
        context: String,
    },
    #[error("RelativePositionBetweenBasePoints must be within [0, 1], found {0}")]
    RelativePositionOutOfRange(f64),
}

impl ParseError {
    /// Errors after which the reader cannot continue with the next building.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ParseError::Io(_)
                | ParseError::Xml(_)
                | ParseError::Attribute(_)
                | ParseError::UnexpectedEof(_)
        )
    }
}

/// Everything that was read from one CityGML file.
#[derive(Debug, Default, Clone)]
pub struct ParsedDataset {
    pub name: String,
    /// From the `gml:Envelope` of the file, or computed from the buildings if the file
    /// has no envelope.
    pub envelope: BoundingBox,
    /// Buildings and building parts, each part after its parent.
    pub buildings: Vec<Building>,
    pub building_annotations: Vec<BuildingAnnotation>,
    pub surface_annotations: Vec<SurfaceAnnotation>,
    pub world_annotations: Vec<WorldCoordinateAnnotation>,
}

impl ParsedDataset {
    /// Union of the bounding boxes of the buildings.
    pub fn buildings_bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox::empty();
        for building in &self.buildings {
            bbox.extend_box(&building.bbox());
        }
        bbox
    }

    fn merge(&mut self, other: BuildingUnit) {
        self.buildings.extend(other.building);
        self.building_annotations.extend(other.building_annotations);
        self.surface_annotations.extend(other.surface_annotations);
    }
}

/// One building (or part) with the annotations that were attached to it. A building
/// without own geometry that only groups its parts has no `building`.
#[derive(Debug, Default)]
struct BuildingUnit {
    building: Option<Building>,
    building_annotations: Vec<BuildingAnnotation>,
    surface_annotations: Vec<SurfaceAnnotation>,
}

/// The datasets of a set of files, and the files that could not be read.
#[derive(Debug, Default)]
pub struct ImportBatch {
    pub datasets: Vec<ParsedDataset>,
    pub failures: Vec<(PathBuf, ParseError)>,
}

impl ImportBatch {
    pub fn building_count(&self) -> usize {
        self.datasets.iter().map(|d| d.buildings.len()).sum()
    }

    pub fn annotation_count(&self) -> usize {
        self.datasets
            .iter()
            .map(|d| {
                d.building_annotations.len()
                    + d.surface_annotations.len()
                    + d.world_annotations.len()
            })
            .sum()
    }
}

/// Read all files in parallel. Every file is independent, a file that fails is logged and
/// recorded in [`ImportBatch::failures`], it does not stop the others. The datasets are in
/// the order of `paths`.
pub fn parse_files<P: AsRef<Path> + Sync>(paths: &[P]) -> ImportBatch {
    let results: Vec<(PathBuf, Result<ParsedDataset, ParseError>)> = paths
        .par_iter()
        .map(|path| {
            let path = path.as_ref().to_path_buf();
            let res = CityGmlParser::from_file(&path);
            (path, res)
        })
        .collect();
    let mut batch = ImportBatch::default();
    for (path, res) in results {
        match res {
            Ok(dataset) => {
                debug!(
                    "{:?}: {} buildings, envelope {}",
                    &path,
                    dataset.buildings.len(),
                    dataset.envelope
                );
                batch.datasets.push(dataset);
            }
            Err(e) => {
                error!("CityGML {:?} cannot be deserialized: {}", &path, e);
                batch.failures.push((path, e));
            }
        }
    }
    batch
}

/// An XML element that was opened, with its attributes.
#[derive(Debug, Clone)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
}

impl Element {
    fn from_start(start: &BytesStart) -> Result<Self, ParseError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self { name, attributes })
    }

    /// Attribute value by local name, eg. `id` for `gml:id`.
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.rsplit(':').next() == Some(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
enum Node {
    Start(Element),
    Empty(Element),
    End,
    Text(String),
}

/// Pull-reader over the XML events that keeps track of the element depth, so that the
/// readers of the subtrees know where their element ends.
struct XmlCursor<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    depth: usize,
}

impl<R: BufRead> XmlCursor<R> {
    fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            depth: 0,
        }
    }

    /// The next node, or `None` at the end of the document.
    fn next(&mut self) -> Result<Option<Node>, ParseError> {
        loop {
            let node = match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => {
                    self.depth += 1;
                    Some(Node::Start(Element::from_start(&e)?))
                }
                Event::Empty(e) => Some(Node::Empty(Element::from_start(&e)?)),
                Event::End(_) => {
                    self.depth = self.depth.saturating_sub(1);
                    Some(Node::End)
                }
                Event::Text(e) => Some(Node::Text(e.unescape()?.into_owned())),
                Event::CData(e) => Some(Node::Text(String::from_utf8_lossy(&e).into_owned())),
                Event::Eof => {
                    self.buf.clear();
                    return Ok(None);
                }
                _ => None,
            };
            self.buf.clear();
            if node.is_some() {
                return Ok(node);
            }
        }
    }

    /// The next node inside the element `name` that was opened at `depth`. Returns `None`
    /// once that element is closed.
    fn next_child(&mut self, name: &str, depth: usize) -> Result<Option<Node>, ParseError> {
        match self.next()? {
            None => Err(ParseError::UnexpectedEof(name.to_string())),
            Some(Node::End) if self.depth < depth => Ok(None),
            node => Ok(node),
        }
    }

    /// Skip to the end of the element that was opened at `depth`.
    fn skip_to_end(&mut self, name: &str, depth: usize) -> Result<(), ParseError> {
        while self.depth >= depth {
            if self.next()?.is_none() {
                return Err(ParseError::UnexpectedEof(name.to_string()));
            }
        }
        Ok(())
    }

    /// The text content of the element that was just opened, nested elements are skipped.
    fn read_text(&mut self, name: &str) -> Result<String, ParseError> {
        let depth = self.depth;
        let mut text = String::new();
        while let Some(node) = self.next_child(name, depth)? {
            if let Node::Text(t) = node {
                text.push_str(&t);
            }
        }
        Ok(text.trim().to_string())
    }

    fn read_number(&mut self, name: &str) -> Result<f64, ParseError> {
        let text = self.read_text(name)?;
        parse_number(name, &text)
    }
}

fn parse_number(element: &str, value: &str) -> Result<f64, ParseError> {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::MalformedNumber {
            element: element.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Parse a coordinate triple "x y z". The tokens are separated by whitespace and use a `.`
/// decimal separator regardless of the locale.
pub fn parse_coordinates(coordinates: &str) -> Result<Point3, ParseError> {
    let mut points = parse_coordinate_list(coordinates)?;
    if points.len() != 1 {
        return Err(ParseError::MalformedCoordinates(coordinates.to_string()));
    }
    Ok(points.remove(0))
}

/// Parse a `gml:posList` with three values per point.
pub fn parse_coordinate_list(coordinates: &str) -> Result<Vec<Point3>, ParseError> {
    let values = coordinates
        .split_whitespace()
        .map(|token| match token.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(ParseError::MalformedCoordinates(coordinates.to_string())),
        })
        .collect::<Result<Vec<f64>, ParseError>>()?;
    if values.is_empty() || values.len() % 3 != 0 {
        return Err(ParseError::MalformedCoordinates(coordinates.to_string()));
    }
    Ok(values.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

fn parse_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn annotation_properties(element: &Element) -> Result<AnnotationProperties, ParseError> {
    let pointing_direction = match element.attribute("PointingDirection") {
        Some(direction) => parse_coordinates(direction)?,
        None => [0.0, 0.0, 0.0],
    };
    Ok(AnnotationProperties {
        scale_with_viewer_distance: parse_flag(element.attribute("ScaleWithCameraDistance")),
        scale_on_selection: parse_flag(element.attribute("ScaleBySelection")),
        pointing_direction,
    })
}

/// The children of an annotation element, collected in one pass.
#[derive(Debug, Default)]
struct AnnotationBody {
    text: Option<String>,
    local_scale: Option<f64>,
    relative_position: Option<f64>,
    height_above_base_line: Option<f64>,
    position: Option<Point3>,
}

impl AnnotationBody {
    fn content(&self, context: &str) -> Result<AnnotationContent, ParseError> {
        let text = self.text.clone().ok_or_else(|| ParseError::MissingElement {
            element: "Text",
            context: context.to_string(),
        })?;
        let size = self.local_scale.ok_or_else(|| ParseError::MissingElement {
            element: "LocalScale",
            context: context.to_string(),
        })?;
        Ok(AnnotationContent::Text { text, size })
    }
}

/// State of the building that is being read.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Lod {
    Lod1,
    Lod2,
}

/// Reads one CityGML document.
pub struct CityGmlParser<R: BufRead> {
    name: String,
    /// Identifies the document in the ids of world annotations without a `gml:id`.
    /// Files that share a stem must not share it.
    source_id: String,
    cursor: XmlCursor<R>,
}

impl CityGmlParser<BufReader<File>> {
    /// Read a CityGML file. The dataset is named after the file stem, world annotations
    /// without a `gml:id` are identified by the path of the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ParsedDataset, ParseError> {
        let file = File::open(path.as_ref())?;
        let name = path
            .as_ref()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("{} deserialization started", &name);
        let dataset = CityGmlParser::new(name, BufReader::new(file))
            .source_id(path.as_ref().to_string_lossy().into_owned())
            .parse()?;
        debug!("{} deserialization completed", &dataset.name);
        Ok(dataset)
    }
}

impl<'a> CityGmlParser<&'a [u8]> {
    pub fn from_str(name: &str, xml: &'a str) -> Result<ParsedDataset, ParseError> {
        CityGmlParser::new(name.to_string(), xml.as_bytes()).parse()
    }
}

impl<R: BufRead> CityGmlParser<R> {
    pub fn new(name: String, source: R) -> Self {
        Self {
            source_id: name.clone(),
            name,
            cursor: XmlCursor::new(source),
        }
    }

    /// Set the identity of the document, the dataset name by default.
    pub fn source_id(mut self, source_id: String) -> Self {
        self.source_id = source_id;
        self
    }

    pub fn from_reader(name: &str, source: R) -> Result<ParsedDataset, ParseError> {
        CityGmlParser::new(name.to_string(), source).parse()
    }

    pub fn parse(mut self) -> Result<ParsedDataset, ParseError> {
        let mut dataset = ParsedDataset {
            name: self.name.clone(),
            ..Default::default()
        };
        let mut envelope: Option<BoundingBox> = None;

        while let Some(node) = self.cursor.next()? {
            if let Node::Start(element) = node {
                match element.name.as_str() {
                    "Envelope" if envelope.is_none() => {
                        envelope = Some(self.parse_envelope()?);
                    }
                    "Building" => {
                        let depth = self.cursor.depth;
                        let mut parts = Vec::new();
                        match self.parse_building(&element, &mut parts) {
                            Ok(unit) => dataset.merge(unit),
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                error!("{}: {}", &self.name, e);
                                self.cursor.skip_to_end(&element.name, depth)?;
                            }
                        }
                        for part in parts {
                            dataset.merge(part);
                        }
                    }
                    "WorldCoordinateAnnotation" => {
                        let n = dataset.world_annotations.len() + 1;
                        let depth = self.cursor.depth;
                        match self.parse_world_annotation(&element, n) {
                            Ok(annotation) => dataset.world_annotations.push(annotation),
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                error!("{}: invalid WorldCoordinateAnnotation: {}", &self.name, e);
                                self.cursor.skip_to_end(&element.name, depth)?;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let buildings_bbox = dataset.buildings_bbox();
        dataset.envelope = match envelope {
            Some(envelope) => {
                let outside = dataset
                    .buildings
                    .iter()
                    .filter(|b| b.bbox().is_initialized() && !envelope.contains_box(&b.bbox()))
                    .count();
                if outside > 0 {
                    warn!(
                        "{}: {} buildings are not within the envelope {}",
                        &self.name, outside, envelope
                    );
                }
                envelope
            }
            None => {
                warn!(
                    "{}: the file has no envelope, using the extent of the buildings",
                    &self.name
                );
                buildings_bbox
            }
        };
        info!(
            "{}: {} buildings, {} annotations",
            &self.name,
            dataset.buildings.len(),
            dataset.building_annotations.len()
                + dataset.surface_annotations.len()
                + dataset.world_annotations.len()
        );
        Ok(dataset)
    }

    fn parse_envelope(&mut self) -> Result<BoundingBox, ParseError> {
        let depth = self.cursor.depth;
        let mut lower: Option<Point3> = None;
        let mut upper: Option<Point3> = None;
        while let Some(node) = self.cursor.next_child("Envelope", depth)? {
            if let Node::Start(element) = node {
                match element.name.as_str() {
                    "lowerCorner" => {
                        lower = Some(parse_coordinates(&self.cursor.read_text("lowerCorner")?)?)
                    }
                    "upperCorner" => {
                        upper = Some(parse_coordinates(&self.cursor.read_text("upperCorner")?)?)
                    }
                    _ => {}
                }
            }
        }
        let lower = lower.ok_or(ParseError::MissingEnvelopeCorner("lowerCorner"))?;
        let upper = upper.ok_or(ParseError::MissingEnvelopeCorner("upperCorner"))?;
        Ok(BoundingBox::from_corners(&lower, &upper))
    }

    /// Read a building or building part. Its parts are read recursively and appended to
    /// `parts`, depth-first, so that they end up after their parent. A part that fails is
    /// logged and skipped without failing its parent.
    fn parse_building(
        &mut self,
        element: &Element,
        parts: &mut Vec<BuildingUnit>,
    ) -> Result<BuildingUnit, ParseError> {
        let depth = self.cursor.depth;
        let id = element.attribute("id").unwrap_or_default().to_string();
        let mut building = Building::new(id.clone(), 0.0);
        let mut height: Option<f64> = None;
        let mut lod: Option<Lod> = None;
        let mut unit = BuildingUnit::default();

        while let Some(node) = self.cursor.next_child(&element.name, depth)? {
            match node {
                Node::Start(child) => match child.name.as_str() {
                    "measuredHeight" => {
                        height = Some(self.cursor.read_number("measuredHeight")?);
                    }
                    "BuildingAnnotation" => {
                        let n = unit.building_annotations.len() + 1;
                        let annotation = self.parse_building_annotation(&child, &id, n)?;
                        unit.building_annotations.push(annotation);
                    }
                    "lod1Solid" | "lod1MultiSurface" => {
                        lod = Some(Lod::Lod1);
                        self.parse_geometry(&child, SurfaceType::Undefined, &mut building, &mut unit)?;
                    }
                    "lod2Solid" | "lod2MultiSurface" => {
                        lod = Some(Lod::Lod2);
                        self.parse_geometry(&child, SurfaceType::Undefined, &mut building, &mut unit)?;
                    }
                    "boundedBy" => {
                        if self.parse_boundary(&mut building, &mut unit)? {
                            lod = Some(Lod::Lod2);
                        }
                    }
                    "consistsOfBuildingPart" => self.parse_building_parts(parts)?,
                    _ => {
                        let child_depth = self.cursor.depth;
                        self.cursor.skip_to_end(&child.name, child_depth)?;
                    }
                },
                Node::Empty(child) => match child.name.as_str() {
                    // Solids that only reference their boundary surfaces by xlink
                    "lod1Solid" => lod = lod.or(Some(Lod::Lod1)),
                    "lod2Solid" => lod = lod.or(Some(Lod::Lod2)),
                    _ => {}
                },
                Node::End | Node::Text(_) => {}
            }
        }

        let height = height.ok_or_else(|| ParseError::MissingHeight(id.clone()))?;
        building.measured_height = height;
        match lod {
            None if building.surface_count() == 0 && !parts.is_empty() => {
                debug!("Building {} only groups its {} parts", &id, parts.len());
            }
            None => return Err(ParseError::UnknownLod(id)),
            Some(lod) => {
                debug!(
                    "Building {} {:?} with {} surfaces",
                    &id,
                    lod,
                    building.surface_count()
                );
                unit.building = Some(building);
            }
        }
        Ok(unit)
    }

    fn parse_building_parts(&mut self, parts: &mut Vec<BuildingUnit>) -> Result<(), ParseError> {
        let depth = self.cursor.depth;
        while let Some(node) = self.cursor.next_child("consistsOfBuildingPart", depth)? {
            if let Node::Start(element) = node {
                if element.name != "BuildingPart" {
                    continue;
                }
                let part_depth = self.cursor.depth;
                let mut sub_parts = Vec::new();
                match self.parse_building(&element, &mut sub_parts) {
                    Ok(unit) => parts.push(unit),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        error!("{}: {}", &self.name, e);
                        self.cursor.skip_to_end(&element.name, part_depth)?;
                    }
                }
                parts.append(&mut sub_parts);
            }
        }
        Ok(())
    }

    /// Read a `boundedBy` element. Returns `false` if it does not hold a boundary surface
    /// (eg. a `gml:boundedBy` with the envelope of the building).
    fn parse_boundary(
        &mut self,
        building: &mut Building,
        unit: &mut BuildingUnit,
    ) -> Result<bool, ParseError> {
        let depth = self.cursor.depth;
        let mut is_surface = false;
        while let Some(node) = self.cursor.next_child("boundedBy", depth)? {
            if let Node::Start(element) = node {
                if element.name == "Envelope" {
                    let envelope_depth = self.cursor.depth;
                    self.cursor.skip_to_end(&element.name, envelope_depth)?;
                    continue;
                }
                let surface_type: SurfaceType = element.name.parse().unwrap_or_default();
                is_surface = true;
                self.parse_geometry(&element, surface_type, building, unit)?;
            }
        }
        Ok(is_surface)
    }

    /// Read every polygon inside `element` as a surface of `surface_type`.
    fn parse_geometry(
        &mut self,
        element: &Element,
        surface_type: SurfaceType,
        building: &mut Building,
        unit: &mut BuildingUnit,
    ) -> Result<(), ParseError> {
        let depth = self.cursor.depth;
        while let Some(node) = self.cursor.next_child(&element.name, depth)? {
            if let Node::Start(child) = node {
                if child.name == "Polygon" {
                    let fallback_id =
                        format!("{}--{:04}", &building.id, building.surface_count() + 1);
                    let (surface, annotations) =
                        self.parse_polygon(&child, fallback_id, surface_type, &building.id)?;
                    if !surface.is_triangulable() {
                        warn!(
                            "Surface {} of building {} has only {} points",
                            &surface.id,
                            &building.id,
                            surface.points.len()
                        );
                    }
                    if building.add_surface(surface).is_some() {
                        warn!("Building {} has a duplicate surface id", &building.id);
                    }
                    unit.surface_annotations.extend(annotations);
                }
            }
        }
        Ok(())
    }

    fn parse_polygon(
        &mut self,
        element: &Element,
        fallback_id: String,
        surface_type: SurfaceType,
        building_id: &str,
    ) -> Result<(Surface, Vec<SurfaceAnnotation>), ParseError> {
        let depth = self.cursor.depth;
        let id = element
            .attribute("id")
            .map(str::to_string)
            .unwrap_or(fallback_id);
        let mut surface = Surface::new(id, surface_type);
        let mut annotations = Vec::new();

        while let Some(node) = self.cursor.next_child(&element.name, depth)? {
            if let Node::Start(child) = node {
                match child.name.as_str() {
                    "pos" => {
                        let point = parse_coordinates(&self.cursor.read_text("pos")?)?;
                        surface.push_point(point);
                    }
                    "posList" => {
                        for point in parse_coordinate_list(&self.cursor.read_text("posList")?)? {
                            surface.push_point(point);
                        }
                    }
                    "interior" => {
                        debug!("Skipping an interior ring of surface {}", &surface.id);
                        let interior_depth = self.cursor.depth;
                        self.cursor.skip_to_end(&child.name, interior_depth)?;
                    }
                    "SurfaceAnnotation" => {
                        let anchor_index = match surface.points.len() {
                            0 => {
                                warn!(
                                    "SurfaceAnnotation before the first point of surface {}, anchoring it on the first point",
                                    &surface.id
                                );
                                0
                            }
                            n => n - 1,
                        };
                        let n = annotations.len() + 1;
                        let annotation = self.parse_surface_annotation(
                            &child,
                            &surface.id,
                            building_id,
                            anchor_index,
                            n,
                        )?;
                        annotations.push(annotation);
                    }
                    _ => {}
                }
            }
        }
        Ok((surface, annotations))
    }

    fn parse_annotation_body(&mut self, element: &Element) -> Result<AnnotationBody, ParseError> {
        let depth = self.cursor.depth;
        let mut body = AnnotationBody::default();
        while let Some(node) = self.cursor.next_child(&element.name, depth)? {
            if let Node::Start(child) = node {
                match child.name.as_str() {
                    "Text" => body.text = Some(self.cursor.read_text("Text")?),
                    "LocalScale" => body.local_scale = Some(self.cursor.read_number("LocalScale")?),
                    "RelativePositionBetweenBasePoints" => {
                        body.relative_position =
                            Some(self.cursor.read_number("RelativePositionBetweenBasePoints")?)
                    }
                    "HeightAboveBaseLine" => {
                        body.height_above_base_line =
                            Some(self.cursor.read_number("HeightAboveBaseLine")?)
                    }
                    "pos" => body.position = Some(parse_coordinates(&self.cursor.read_text("pos")?)?),
                    _ => {}
                }
            }
        }
        Ok(body)
    }

    fn parse_building_annotation(
        &mut self,
        element: &Element,
        building_id: &str,
        n: usize,
    ) -> Result<BuildingAnnotation, ParseError> {
        let properties = annotation_properties(element)?;
        let body = self.parse_annotation_body(element)?;
        Ok(BuildingAnnotation {
            id: format!("{}#b{}", building_id, n),
            building_id: building_id.to_string(),
            properties,
            content: body.content(&format!("BuildingAnnotation of {}", building_id))?,
        })
    }

    fn parse_surface_annotation(
        &mut self,
        element: &Element,
        surface_id: &str,
        building_id: &str,
        anchor_index: usize,
        n: usize,
    ) -> Result<SurfaceAnnotation, ParseError> {
        let context = format!("SurfaceAnnotation of {}", surface_id);
        let properties = annotation_properties(element)?;
        let body = self.parse_annotation_body(element)?;
        let relative_position = body.relative_position.ok_or_else(|| ParseError::MissingElement {
            element: "RelativePositionBetweenBasePoints",
            context: context.clone(),
        })?;
        if !(0.0..=1.0).contains(&relative_position) {
            return Err(ParseError::RelativePositionOutOfRange(relative_position));
        }
        let height_above_base_line =
            body.height_above_base_line
                .ok_or_else(|| ParseError::MissingElement {
                    element: "HeightAboveBaseLine",
                    context: context.clone(),
                })?;
        Ok(SurfaceAnnotation {
            id: format!("{}#s{}", surface_id, n),
            building_id: building_id.to_string(),
            surface_id: surface_id.to_string(),
            anchor_index,
            relative_position,
            height_above_base_line,
            properties,
            content: body.content(&context)?,
        })
    }

    fn parse_world_annotation(
        &mut self,
        element: &Element,
        n: usize,
    ) -> Result<WorldCoordinateAnnotation, ParseError> {
        let properties = annotation_properties(element)?;
        let body = self.parse_annotation_body(element)?;
        let position = body.position.ok_or_else(|| ParseError::MissingElement {
            element: "pos",
            context: "WorldCoordinateAnnotation".to_string(),
        })?;
        Ok(WorldCoordinateAnnotation {
            id: element
                .attribute("id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}#w{}", &self.source_id, n)),
            position,
            properties,
            content: body.content("WorldCoordinateAnnotation")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_data_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("resources")
            .join("data")
    }

    const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<core:CityModel xmlns:core="http://www.opengis.net/citygml/2.0"
    xmlns:bldg="http://www.opengis.net/citygml/building/2.0"
    xmlns:gml="http://www.opengis.net/gml"
    xmlns:annotation="http://example.org/annotation">"#;

    fn document(body: &str) -> String {
        format!("{}\n{}\n</core:CityModel>", HEADER, body)
    }

    fn lod1_building(id: &str, height: &str) -> String {
        format!(
            r#"<core:cityObjectMember><bldg:Building gml:id="{id}">
  <bldg:measuredHeight uom="urn:adv:uom:m">{height}</bldg:measuredHeight>
  <bldg:lod1Solid><gml:Solid><gml:exterior><gml:CompositeSurface>
    <gml:surfaceMember><gml:Polygon><gml:exterior><gml:LinearRing>
      <gml:pos>0 0 5</gml:pos><gml:pos>1 0 5</gml:pos><gml:pos>1 1 5</gml:pos><gml:pos>0 1 5</gml:pos><gml:pos>0 0 5</gml:pos>
    </gml:LinearRing></gml:exterior></gml:Polygon></gml:surfaceMember>
    <gml:surfaceMember><gml:Polygon gml:id="{id}-floor"><gml:exterior><gml:LinearRing>
      <gml:posList>0 0 2 0 1 2 1 1 2 1 0 2 0 0 2</gml:posList>
    </gml:LinearRing></gml:exterior></gml:Polygon></gml:surfaceMember>
  </gml:CompositeSurface></gml:exterior></gml:Solid></bldg:lod1Solid>
</bldg:Building></core:cityObjectMember>"#
        )
    }

    #[test]
    fn test_parse_coordinates() {
        assert_eq!(
            parse_coordinates("33311699.707 599549.332 23.705").unwrap(),
            [33311699.707, 599549.332, 23.705]
        );
        assert_eq!(parse_coordinates(" 1\t2\n3 ").unwrap(), [1.0, 2.0, 3.0]);
        assert!(parse_coordinates("1,5 2 3").is_err());
        assert!(parse_coordinates("1 2").is_err());
        assert!(parse_coordinates("1 2 3 4").is_err());
        assert!(parse_coordinates("1 NaN 3").is_err());
        assert_eq!(parse_coordinate_list("0 0 0 1 1 1").unwrap().len(), 2);
    }

    #[test]
    fn test_lod1_building() {
        let xml = document(&lod1_building("B1", "12.5"));
        let dataset = CityGmlParser::from_str("lod1", &xml).unwrap();
        assert_eq!(dataset.buildings.len(), 1);
        let building = &dataset.buildings[0];
        assert_eq!(building.id, "B1");
        assert_eq!(building.measured_height, 12.5);
        let ids: Vec<&str> = building.surfaces().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["B1--0001", "B1-floor"]);
        assert!(building
            .surfaces()
            .iter()
            .all(|s| s.surface_type == SurfaceType::Undefined));
        // the closing point is dropped
        assert_eq!(building.surfaces()[0].points.len(), 4);
        assert_eq!(building.surfaces()[1].points.len(), 4);
        // no envelope in the file
        assert_eq!(dataset.envelope, building.bbox());
    }

    #[test]
    fn test_missing_height_fails_only_that_building() {
        let body = format!(
            "{}{}",
            lod1_building("B1", "not a number"),
            lod1_building("B2", "4.0")
        );
        let dataset = CityGmlParser::from_str("heights", &document(&body)).unwrap();
        let ids: Vec<&str> = dataset.buildings.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["B2"]);

        let no_height = r#"<bldg:Building gml:id="B3"><bldg:lod2Solid/></bldg:Building>"#;
        let dataset = CityGmlParser::from_str("heights", &document(no_height)).unwrap();
        assert!(dataset.buildings.is_empty());
    }

    #[test]
    fn test_unknown_lod_fails_only_that_building() {
        let body = format!(
            r#"<bldg:Building gml:id="B0"><bldg:measuredHeight>3</bldg:measuredHeight>
<bldg:lod4Solid><gml:Solid/></bldg:lod4Solid></bldg:Building>{}"#,
            lod1_building("B1", "3")
        );
        let dataset = CityGmlParser::from_str("lods", &document(&body)).unwrap();
        assert_eq!(dataset.buildings.len(), 1);
        assert_eq!(dataset.buildings[0].id, "B1");
    }

    #[test]
    fn test_malformed_coordinates_fail_the_building() {
        let body = lod1_building("B1", "3").replace("<gml:pos>1 1 5</gml:pos>", "<gml:pos>1 a 5</gml:pos>");
        let dataset = CityGmlParser::from_str("coords", &document(&body)).unwrap();
        assert!(dataset.buildings.is_empty());
    }

    #[test]
    fn test_broken_xml_fails_the_file() {
        let xml = document(&lod1_building("B1", "3")).replace("</bldg:Building>", "</bldg:Buildin>");
        let res = CityGmlParser::from_str("broken", &xml);
        assert!(matches!(res, Err(ParseError::Xml(_))));
    }

    #[test]
    fn test_envelope_requires_both_corners() {
        let xml = document(
            r#"<gml:boundedBy><gml:Envelope srsDimension="3">
<gml:lowerCorner>0 0 0</gml:lowerCorner></gml:Envelope></gml:boundedBy>"#,
        );
        let res = CityGmlParser::from_str("envelope", &xml);
        assert!(matches!(
            res,
            Err(ParseError::MissingEnvelopeCorner("upperCorner"))
        ));
    }

    #[test]
    fn test_lod2_building_from_file() {
        let dataset = CityGmlParser::from_file(test_data_dir().join("lod2_building.gml")).unwrap();
        assert_eq!(dataset.name, "lod2_building");
        assert_eq!(
            dataset.envelope,
            BoundingBox::from_corners(&[1000.0, 2000.0, 0.0], &[1001.0, 2001.0, 3.0])
        );
        assert_eq!(dataset.buildings.len(), 1);
        let building = &dataset.buildings[0];
        assert_eq!(building.measured_height, 3.0);
        assert_eq!(building.surface_count(), 6);
        let types: Vec<SurfaceType> = building.surfaces().iter().map(|s| s.surface_type).collect();
        assert_eq!(
            types,
            vec![
                SurfaceType::GroundSurface,
                SurfaceType::WallSurface,
                SurfaceType::WallSurface,
                SurfaceType::WallSurface,
                SurfaceType::WallSurface,
                SurfaceType::RoofSurface
            ]
        );
        assert!(building.surfaces().iter().all(|s| s.points.len() == 4));

        assert_eq!(dataset.building_annotations.len(), 1);
        let annotation = &dataset.building_annotations[0];
        assert_eq!(annotation.id, "BLDG_0001#b1");
        assert_eq!(annotation.building_id, "BLDG_0001");
        assert_eq!(
            annotation.content,
            AnnotationContent::Text {
                text: "Test".to_string(),
                size: 1.5
            }
        );
        assert!(annotation.properties.scale_with_viewer_distance);
        assert!(!annotation.properties.scale_on_selection);
        assert!(annotation.properties.faces_viewer());

        assert_eq!(dataset.surface_annotations.len(), 1);
        let annotation = &dataset.surface_annotations[0];
        assert_eq!(annotation.surface_id, "BLDG_0001-wall-south");
        assert_eq!(annotation.building_id, "BLDG_0001");
        assert_eq!(annotation.anchor_index, 0);
        assert_eq!(annotation.relative_position, 0.5);
        assert_eq!(annotation.height_above_base_line, 0.0);
        assert_eq!(annotation.properties.pointing_direction, [0.0, -1.0, 0.0]);

        assert_eq!(dataset.world_annotations.len(), 1);
        let annotation = &dataset.world_annotations[0];
        let path = test_data_dir().join("lod2_building.gml");
        assert_eq!(annotation.id, format!("{}#w1", path.to_string_lossy()));
        assert_eq!(annotation.position, [1010.0, 2010.0, 1.5]);
    }

    #[test]
    fn test_building_parts_are_flattened_depth_first() {
        let dataset = CityGmlParser::from_file(test_data_dir().join("building_parts.gml")).unwrap();
        let ids: Vec<&str> = dataset.buildings.iter().map(|b| b.id.as_str()).collect();
        // PART_2 has no measuredHeight and is skipped, its siblings survive.
        assert_eq!(ids, vec!["MAIN", "PART_1", "PART_1_1", "PART_3"]);
        let surface_annotation = &dataset.surface_annotations[0];
        assert_eq!(surface_annotation.building_id, "PART_1");
        assert_eq!(surface_annotation.anchor_index, 2);
    }

    #[test]
    fn test_building_without_geometry_keeps_its_parts() {
        let body = format!(
            r#"<bldg:Building gml:id="GROUP"><bldg:measuredHeight>9</bldg:measuredHeight>
<bldg:consistsOfBuildingPart>{}</bldg:consistsOfBuildingPart></bldg:Building>"#,
            lod1_building("P1", "9").replace("bldg:Building", "bldg:BuildingPart")
        );
        let dataset = CityGmlParser::from_str("group", &document(&body)).unwrap();
        let ids: Vec<&str> = dataset.buildings.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["P1"]);
    }

    #[test]
    fn test_annotation_without_text_fails_its_building() {
        let body = r#"<bldg:Building gml:id="B1"><bldg:measuredHeight>3</bldg:measuredHeight>
<annotation:BuildingAnnotation ScaleWithCameraDistance="True" ScaleBySelection="False" PointingDirection="0 0 0">
  <annotation:SimpleTextAnnotation/>
</annotation:BuildingAnnotation>
<bldg:lod2Solid/></bldg:Building>"#;
        let dataset = CityGmlParser::from_str("annotations", &document(body)).unwrap();
        assert!(dataset.buildings.is_empty());
        assert!(dataset.building_annotations.is_empty());
    }

    const WORLD_ANNOTATION: &str = r#"<annotation:WorldCoordinateAnnotation PointingDirection="0 0 0">
  <gml:pos>10 20 3</gml:pos>
  <annotation:SimpleTextAnnotation><annotation:AnnotationTextComponent>
    <annotation:Text>Kiosk</annotation:Text><annotation:LocalScale>1</annotation:LocalScale>
  </annotation:AnnotationTextComponent></annotation:SimpleTextAnnotation>
</annotation:WorldCoordinateAnnotation>"#;

    #[test]
    fn test_world_annotation_ids() {
        let with_id = WORLD_ANNOTATION.replace(
            "<annotation:WorldCoordinateAnnotation ",
            r#"<annotation:WorldCoordinateAnnotation gml:id="KIOSK" "#,
        );
        let body = format!("{}\n{}", with_id, WORLD_ANNOTATION);
        let dataset = CityGmlParser::from_reader("tile", document(&body).as_bytes()).unwrap();
        let ids: Vec<&str> = dataset.world_annotations.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["KIOSK", "tile#w2"]);
    }

    /// Tiles with the same file name in different directories.
    #[test]
    fn test_world_annotation_ids_of_files_with_the_same_stem() {
        let dir = std::env::temp_dir().join(format!("gmlanchor-parser-{}", std::process::id()));
        let paths = vec![dir.join("a").join("tile.gml"), dir.join("b").join("tile.gml")];
        for path in &paths {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, document(WORLD_ANNOTATION)).unwrap();
        }
        let batch = parse_files(&paths);
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(batch.datasets.len(), 2);
        assert_eq!(batch.datasets[0].name, batch.datasets[1].name);
        let a = &batch.datasets[0].world_annotations[0].id;
        let b = &batch.datasets[1].world_annotations[0].id;
        assert_ne!(a, b);
        assert_eq!(a, &format!("{}#w1", paths[0].to_string_lossy()));
    }

    #[test]
    fn test_parse_files_keeps_going_after_a_failure() {
        let paths = vec![
            test_data_dir().join("lod2_building.gml"),
            test_data_dir().join("broken.gml"),
            test_data_dir().join("does_not_exist.gml"),
            test_data_dir().join("building_parts.gml"),
        ];
        let batch = parse_files(&paths);
        assert_eq!(batch.datasets.len(), 2);
        assert_eq!(batch.datasets[0].name, "lod2_building");
        assert_eq!(batch.datasets[1].name, "building_parts");
        assert_eq!(batch.failures.len(), 2);
        assert!(matches!(batch.failures[1].1, ParseError::Io(_)));
        assert_eq!(batch.building_count(), 5);
    }
}
