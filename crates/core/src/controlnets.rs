//! Remote ControlNet tables installed by the `install_control_net_*` flags.
//!
//! Entries are `(base, repo_path, name)`; `repo_path` may carry a subfolder
//! after the `owner/repo` pair.

use crate::registry::BaseFamily;

pub type ControlNetEntry = (BaseFamily, &'static str, &'static str);

pub const V10_MODELS: &[ControlNetEntry] = &[
    (BaseFamily::Sd1, "lllyasviel/sd-controlnet-canny", "control_sd15_canny"),
    (BaseFamily::Sd1, "lllyasviel/sd-controlnet-depth", "control_sd15_depth"),
    (BaseFamily::Sd1, "lllyasviel/sd-controlnet-hed", "control_sd15_hed"),
    (BaseFamily::Sd1, "lllyasviel/sd-controlnet-mlsd", "control_sd15_mlsd"),
    (BaseFamily::Sd1, "lllyasviel/sd-controlnet-normal", "control_sd15_normal"),
    (BaseFamily::Sd1, "lllyasviel/sd-controlnet-openpose", "control_sd15_openpose"),
    (BaseFamily::Sd1, "lllyasviel/sd-controlnet-scribble", "control_sd15_scribble"),
    (BaseFamily::Sd1, "lllyasviel/sd-controlnet-seg", "control_sd15_seg"),
];

pub const V11_MODELS: &[ControlNetEntry] = &[
    (BaseFamily::Sd1, "lllyasviel/control_v11p_sd15_canny", "control_v11p_sd15_canny"),
    (BaseFamily::Sd1, "lllyasviel/control_v11f1p_sd15_depth", "control_v11f1p_sd15_depth"),
    (BaseFamily::Sd1, "lllyasviel/control_v11p_sd15_inpaint", "control_v11p_sd15_inpaint"),
    (BaseFamily::Sd1, "lllyasviel/control_v11e_sd15_ip2p", "control_v11e_sd15_ip2p"),
    (BaseFamily::Sd1, "lllyasviel/control_v11p_sd15_lineart", "control_v11p_sd15_lineart"),
    (
        BaseFamily::Sd1,
        "lllyasviel/control_v11p_sd15s2_lineart_anime",
        "control_v11p_sd15s2_lineart_anime",
    ),
    (BaseFamily::Sd1, "lllyasviel/control_v11p_sd15_mlsd", "control_v11p_sd15_mlsd"),
    (BaseFamily::Sd1, "lllyasviel/control_v11p_sd15_normalbae", "control_v11p_sd15_normalbae"),
    (BaseFamily::Sd1, "lllyasviel/control_v11p_sd15_openpose", "control_v11p_sd15_openpose"),
    (BaseFamily::Sd1, "lllyasviel/control_v11p_sd15_scribble", "control_v11p_sd15_scribble"),
    (BaseFamily::Sd1, "lllyasviel/control_v11p_sd15_seg", "control_v11p_sd15_seg"),
    (BaseFamily::Sd1, "lllyasviel/control_v11e_sd15_shuffle", "control_v11e_sd15_shuffle"),
    (BaseFamily::Sd1, "lllyasviel/control_v11p_sd15_softedge", "control_v11p_sd15_softedge"),
    (BaseFamily::Sd1, "lllyasviel/control_v11u_sd15_tile", "control_v11u_sd15_tile"),
];

pub const MEDIAPIPE_V2_MODELS: &[ControlNetEntry] = &[
    (
        BaseFamily::Sd1,
        "CrucibleAI/ControlNetMediaPipeFace/diffusion_sd15",
        "control_v2p_sd15_mediapipe_face",
    ),
    (
        BaseFamily::Sd2,
        "CrucibleAI/ControlNetMediaPipeFace",
        "control_v2p_sd21_mediapipe_face",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique_across_tables() {
        let mut seen = HashSet::new();
        for (_, _, name) in V10_MODELS.iter().chain(V11_MODELS).chain(MEDIAPIPE_V2_MODELS) {
            assert!(seen.insert(*name), "duplicate control net {name}");
            assert!(!name.contains(' '));
        }
    }
}
