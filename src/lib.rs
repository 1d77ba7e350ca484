// Copyright 2023 Balázs Dukai, Ravi Peters
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Import CityGML buildings and their annotations into a spatial store, and place them
//! around a detected marker target for an augmented-reality viewer.
pub mod cli;
pub mod config;
pub mod formats;
pub mod geometry;
pub mod model;
pub mod parser;
pub mod scene;
pub mod spatial_structs;
pub mod store;
pub mod transform;
