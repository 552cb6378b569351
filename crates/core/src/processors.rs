//! Control-image preprocessors known to the resolver.

use serde::Serialize;
use std::collections::BTreeMap;

/// Implementation identity; one cached instance is kept per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorClass {
    Canny,
    ScribbleXdog,
    ContentShuffle,
    Invert,
    Leres,
    Midas,
    Zoe,
    LineartAnime,
    Lineart,
    MediapipeFace,
    Mlsd,
    NormalBae,
    Openpose,
    Hed,
    PidiNet,
}

/// Hub repository holding the annotator checkpoints.
pub const ANNOTATORS_REPO: &str = "lllyasviel/Annotators";

impl ProcessorClass {
    /// Whether the detector is a neural network rather than a fixed filter.
    pub fn is_neural(self) -> bool {
        !matches!(
            self,
            Self::Canny | Self::ScribbleXdog | Self::ContentShuffle | Self::Invert
        )
    }

    /// Repository the detector's weights come from, if any.
    pub fn weights_repo(self) -> Option<&'static str> {
        match self {
            Self::Canny | Self::ScribbleXdog | Self::ContentShuffle | Self::Invert | Self::MediapipeFace => None,
            _ => Some(ANNOTATORS_REPO),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorInfo {
    pub name: &'static str,
    /// `None` for the pass-through entry
    pub class: Option<ProcessorClass>,
    pub defaults: BTreeMap<String, f64>,
}

impl ProcessorInfo {
    /// Defaults overlaid with the caller's parameters.
    pub fn params(&self, given: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let mut params = self.defaults.clone();
        params.extend(given.iter().map(|(k, v)| (k.clone(), *v)));
        params
    }
}

const NAMES: [&str; 29] = [
    "canny",
    "depth_leres",
    "depth_leres++",
    "depth_midas",
    "depth_zoe",
    "invert",
    "lineart_anime",
    "lineart_coarse",
    "lineart_realistic",
    "mediapipe_face",
    "mlsd",
    "none",
    "normal_bae",
    "normal_midas",
    "openpose",
    "openpose_face",
    "openpose_faceonly",
    "openpose_full",
    "openpose_hand",
    "scribble_hed",
    "scribble_hedsafe",
    "scribble_pidinet",
    "scribble_pidisafe",
    "scribble_xdog",
    "shuffle",
    "softedge_hed",
    "softedge_hedsafe",
    "softedge_pidinet",
    "softedge_pidsafe",
];

pub fn names() -> &'static [&'static str] {
    &NAMES
}

/// Registry entry for `name`. Boolean detector switches are carried as
/// `1.0` and `0.0`.
pub fn lookup(name: &str) -> Option<ProcessorInfo> {
    use ProcessorClass::*;

    let (class, defaults): (_, &[(&str, f64)]) = match name {
        "none" => (None, &[]),
        "canny" => (Some(Canny), &[("low", 100.0), ("high", 200.0)]),
        "depth_leres" => (Some(Leres), &[("boost", 0.0)]),
        "depth_leres++" => (Some(Leres), &[("boost", 1.0)]),
        "depth_midas" => (Some(Midas), &[]),
        "depth_zoe" => (Some(Zoe), &[]),
        "invert" => (Some(Invert), &[]),
        "lineart_anime" => (Some(LineartAnime), &[]),
        "lineart_coarse" => (Some(Lineart), &[("coarse", 1.0)]),
        "lineart_realistic" => (Some(Lineart), &[("coarse", 0.0)]),
        "mediapipe_face" => (Some(MediapipeFace), &[]),
        "mlsd" => (Some(Mlsd), &[]),
        "normal_bae" => (Some(NormalBae), &[]),
        "normal_midas" => (Some(Midas), &[("depth_and_normal", 1.0)]),
        "openpose" => (
            Some(Openpose),
            &[("include_body", 1.0), ("include_hand", 0.0), ("include_face", 0.0)],
        ),
        "openpose_face" => (
            Some(Openpose),
            &[("include_body", 1.0), ("include_hand", 0.0), ("include_face", 1.0)],
        ),
        "openpose_faceonly" => (
            Some(Openpose),
            &[("include_body", 0.0), ("include_hand", 0.0), ("include_face", 1.0)],
        ),
        "openpose_full" => (
            Some(Openpose),
            &[("include_body", 1.0), ("include_hand", 1.0), ("include_face", 1.0)],
        ),
        "openpose_hand" => (
            Some(Openpose),
            &[("include_body", 0.0), ("include_hand", 1.0), ("include_face", 0.0)],
        ),
        "scribble_hed" => (Some(Hed), &[("scribble", 1.0), ("safe", 0.0)]),
        "scribble_hedsafe" => (Some(Hed), &[("scribble", 1.0), ("safe", 1.0)]),
        "scribble_pidinet" => (Some(PidiNet), &[("scribble", 1.0), ("safe", 0.0)]),
        "scribble_pidisafe" => (Some(PidiNet), &[("scribble", 1.0), ("safe", 1.0)]),
        "scribble_xdog" => (Some(ScribbleXdog), &[("threshold", 32.0)]),
        "shuffle" => (Some(ContentShuffle), &[("seed", 0.0)]),
        "softedge_hed" => (Some(Hed), &[("scribble", 0.0), ("safe", 0.0)]),
        "softedge_hedsafe" => (Some(Hed), &[("scribble", 0.0), ("safe", 1.0)]),
        "softedge_pidinet" => (Some(PidiNet), &[("scribble", 0.0), ("safe", 0.0)]),
        "softedge_pidsafe" => (Some(PidiNet), &[("scribble", 0.0), ("safe", 1.0)]),
        _ => return None,
    };
    let name = NAMES.iter().copied().find(|n| *n == name)?;

    Some(ProcessorInfo {
        name,
        class,
        defaults: defaults.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
    })
}
