use boxrefine::{
    BatchPredictions, BoxRefineError, CoderConfig, DetectorConfig, DirectionConfig, NmsConfig,
    NmsKind, NmsParams, PostProcessor, PredictConfig, ProposalConfig, ProposalMode, ProposalStage,
    RcnnOutput, RecallDict, RoiBatch, RpnOutput, ScoreConfig,
};
use clap::Parser;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const EXAMPLE_JSON: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.json"));

#[derive(Parser, Debug)]
#[command(author, version, about = "Boxrefine CLI (JSON config driven)")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,
    /// Print an example config and exit.
    #[arg(long)]
    print_example: bool,
    /// Enable tracing output for performance profiling.
    #[arg(long)]
    trace: bool,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StageConfig {
    Rpn,
    Proposals,
    Rcnn,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ModeConfig {
    Train,
    Test,
}

impl From<ModeConfig> for ProposalMode {
    fn from(value: ModeConfig) -> Self {
        match value {
            ModeConfig::Train => ProposalMode::Train,
            ModeConfig::Test => ProposalMode::Test,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CoderConfigJson {
    box_dim: usize,
    encode_angle_by_sincos: bool,
}

impl Default for CoderConfigJson {
    fn default() -> Self {
        let cfg = CoderConfig::default();
        Self {
            box_dim: cfg.box_dim,
            encode_angle_by_sincos: cfg.encode_angle_by_sincos,
        }
    }
}

impl From<CoderConfigJson> for CoderConfig {
    fn from(value: CoderConfigJson) -> Self {
        Self {
            box_dim: value.box_dim,
            encode_angle_by_sincos: value.encode_angle_by_sincos,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DirectionConfigJson {
    num_bins: usize,
    dir_offset: f32,
    dir_limit_offset: f32,
}

impl Default for DirectionConfigJson {
    fn default() -> Self {
        let cfg = DirectionConfig::default();
        Self {
            num_bins: cfg.num_bins,
            dir_offset: cfg.dir_offset,
            dir_limit_offset: cfg.dir_limit_offset,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ScoreConfigJson {
    encode_bg_as_zeros: bool,
    use_sigmoid_score: bool,
    use_multi_classes_nms: bool,
}

impl Default for ScoreConfigJson {
    fn default() -> Self {
        let cfg = ScoreConfig::default();
        Self {
            encode_bg_as_zeros: cfg.encode_bg_as_zeros,
            use_sigmoid_score: cfg.use_sigmoid_score,
            use_multi_classes_nms: cfg.use_multi_classes_nms,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct StageConfigJson {
    pre_nms_top_n: usize,
    post_nms_top_n: usize,
    nms_thresh: f32,
    score_thresh: f32,
}

impl From<ProposalStage> for StageConfigJson {
    fn from(value: ProposalStage) -> Self {
        Self {
            pre_nms_top_n: value.pre_nms_top_n,
            post_nms_top_n: value.post_nms_top_n,
            nms_thresh: value.nms_thresh,
            score_thresh: value.score_thresh,
        }
    }
}

impl Default for StageConfigJson {
    fn default() -> Self {
        ProposalConfig::default().test.into()
    }
}

impl From<StageConfigJson> for ProposalStage {
    fn from(value: StageConfigJson) -> Self {
        Self {
            pre_nms_top_n: value.pre_nms_top_n,
            post_nms_top_n: value.post_nms_top_n,
            nms_thresh: value.nms_thresh,
            score_thresh: value.score_thresh,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ProposalConfigJson {
    train: StageConfigJson,
    test: StageConfigJson,
    parallel: bool,
}

impl Default for ProposalConfigJson {
    fn default() -> Self {
        let cfg = ProposalConfig::default();
        Self {
            train: cfg.train.into(),
            test: cfg.test.into(),
            parallel: cfg.parallel,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PredictConfigJson {
    score_thresh: f32,
    nms_type: String,
    nms_soft_type: String,
    nms_thresh: f32,
    sigma: f32,
    nt: f32,
    soft_score_thresh: f32,
    pre_maxsize: usize,
    post_maxsize: usize,
    max_objects_per_scene: usize,
    multi_class_nms_thresh: f32,
    rcnn_score: String,
    recall_iou: String,
    parallel: bool,
}

impl Default for PredictConfigJson {
    fn default() -> Self {
        let cfg = PredictConfig::default();
        let params = NmsParams::default();
        Self {
            score_thresh: cfg.score_thresh,
            nms_type: "rotated".to_string(),
            nms_soft_type: "gaussian".to_string(),
            nms_thresh: params.nms_thresh,
            sigma: params.sigma,
            nt: params.nt,
            soft_score_thresh: params.soft_score_thresh,
            pre_maxsize: cfg.nms.pre_maxsize,
            post_maxsize: cfg.nms.post_maxsize,
            max_objects_per_scene: cfg.nms.max_objects_per_scene,
            multi_class_nms_thresh: cfg.multi_class_nms_thresh,
            rcnn_score: "binary-cross-entropy".to_string(),
            recall_iou: "3d".to_string(),
            parallel: cfg.parallel,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DetectorConfigJson {
    class_names: Vec<String>,
    coder: CoderConfigJson,
    rcnn_coder: CoderConfigJson,
    direction: Option<DirectionConfigJson>,
    score: ScoreConfigJson,
    proposal: ProposalConfigJson,
    predict: PredictConfigJson,
}

impl Default for DetectorConfigJson {
    fn default() -> Self {
        Self {
            class_names: DetectorConfig::default().class_names,
            coder: CoderConfigJson::default(),
            rcnn_coder: CoderConfigJson::default(),
            direction: Some(DirectionConfigJson::default()),
            score: ScoreConfigJson::default(),
            proposal: ProposalConfigJson::default(),
            predict: PredictConfigJson::default(),
        }
    }
}

impl TryFrom<DetectorConfigJson> for DetectorConfig {
    type Error = BoxRefineError;

    fn try_from(value: DetectorConfigJson) -> Result<Self, Self::Error> {
        let num_classes = value.class_names.len();
        let score = ScoreConfig {
            encode_bg_as_zeros: value.score.encode_bg_as_zeros,
            use_sigmoid_score: value.score.use_sigmoid_score,
            use_multi_classes_nms: value.score.use_multi_classes_nms,
        };
        let p = value.predict;
        let kind = NmsKind::from_names(
            &p.nms_type,
            &p.nms_soft_type,
            NmsParams {
                nms_thresh: p.nms_thresh,
                sigma: p.sigma,
                nt: p.nt,
                soft_score_thresh: p.soft_score_thresh,
            },
        )?;
        Ok(Self {
            coder: value.coder.into(),
            rcnn_coder: value.rcnn_coder.into(),
            direction: value.direction.map(|d| DirectionConfig {
                num_bins: d.num_bins,
                dir_offset: d.dir_offset,
                dir_limit_offset: d.dir_limit_offset,
            }),
            proposal: ProposalConfig {
                train: value.proposal.train.into(),
                test: value.proposal.test.into(),
                score,
                num_classes,
                parallel: value.proposal.parallel,
            },
            predict: PredictConfig {
                score,
                score_thresh: p.score_thresh,
                nms: NmsConfig {
                    kind,
                    pre_maxsize: p.pre_maxsize,
                    post_maxsize: p.post_maxsize,
                    max_objects_per_scene: p.max_objects_per_scene,
                },
                multi_class_nms_thresh: p.multi_class_nms_thresh,
                num_classes,
                rcnn_score: p.rcnn_score.parse()?,
                recall_iou: p.recall_iou.parse()?,
                parallel: p.parallel,
            },
            class_names: value.class_names,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Config {
    input_path: String,
    #[serde(default)]
    output_path: Option<String>,
    stage: StageConfig,
    #[serde(default = "default_mode")]
    mode: ModeConfig,
    #[serde(default)]
    detector: DetectorConfigJson,
}

fn default_mode() -> ModeConfig {
    ModeConfig::Test
}

/// Network outputs for one batch, as nested arrays.
#[derive(Debug, Deserialize)]
struct Input {
    anchors: Vec<Vec<Vec<f32>>>,
    rpn_cls: Vec<Vec<Vec<f32>>>,
    rpn_box: Vec<Vec<Vec<f32>>>,
    #[serde(default)]
    rpn_dir: Option<Vec<Vec<Vec<f32>>>>,
    #[serde(default)]
    rcnn_cls: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    rcnn_box: Option<Vec<Vec<Vec<f32>>>>,
    #[serde(default)]
    gt_boxes: Option<Vec<Vec<Vec<f32>>>>,
}

fn to_array3(name: &str, data: Vec<Vec<Vec<f32>>>) -> Result<Array3<f32>, Box<dyn std::error::Error>> {
    let b = data.len();
    let n = data.first().map_or(0, Vec::len);
    let w = data.first().and_then(|s| s.first()).map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(b * n * w);
    for scene in data {
        if scene.len() != n {
            return Err(format!("{name}: scenes have different lengths").into());
        }
        for row in scene {
            if row.len() != w {
                return Err(format!("{name}: rows have different widths").into());
            }
            flat.extend(row);
        }
    }
    Ok(Array3::from_shape_vec((b, n, w), flat)?)
}

fn to_array2(name: &str, data: Vec<Vec<f32>>) -> Result<Array2<f32>, Box<dyn std::error::Error>> {
    let b = data.len();
    let n = data.first().map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(b * n);
    for row in data {
        if row.len() != n {
            return Err(format!("{name}: rows have different lengths").into());
        }
        flat.extend(row);
    }
    Ok(Array2::from_shape_vec((b, n), flat)?)
}

#[derive(Debug, Serialize)]
struct RoiJson {
    label: usize,
    class_name: Option<String>,
    score: f32,
    raw_score: f32,
    #[serde(rename = "box")]
    bbox: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct PredictionJson {
    label: usize,
    class_name: Option<String>,
    score: f32,
    raw_score: f32,
    #[serde(rename = "box")]
    bbox: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roi: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roi_raw_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gt_iou: Option<f32>,
}

#[derive(Debug, Serialize)]
struct RecallJson {
    gt: usize,
    roi_05: usize,
    roi_07: usize,
    rcnn_05: usize,
    rcnn_07: usize,
    rcnn_rank_acc: f64,
    rcnn_iou_diff: f64,
    valid_sample_num: usize,
}

impl From<RecallDict> for RecallJson {
    fn from(value: RecallDict) -> Self {
        Self {
            gt: value.gt,
            roi_05: value.roi_05,
            roi_07: value.roi_07,
            rcnn_05: value.rcnn_05,
            rcnn_07: value.rcnn_07,
            rcnn_rank_acc: value.rcnn_rank_acc,
            rcnn_iou_diff: value.rcnn_iou_diff,
            valid_sample_num: value.valid_sample_num,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Output {
    Proposals { scenes: Vec<Vec<RoiJson>> },
    Predictions {
        scenes: Vec<Vec<PredictionJson>>,
        recall: RecallJson,
    },
}

fn proposals_output(post: &PostProcessor, rois: &RoiBatch) -> Output {
    let scenes = (0..rois.batch_size())
        .map(|scene| {
            (0..rois.num_valid[scene])
                .map(|slot| {
                    let label = rois.roi_labels[[scene, slot]];
                    RoiJson {
                        label,
                        class_name: post.class_name(label).map(str::to_string),
                        score: rois.roi_scores[[scene, slot]],
                        raw_score: rois.roi_raw_scores[[scene, slot]],
                        bbox: rois.rois.slice(ndarray::s![scene, slot, ..]).to_vec(),
                    }
                })
                .collect()
        })
        .collect();
    Output::Proposals { scenes }
}

fn predictions_output(post: &PostProcessor, preds: BatchPredictions) -> Output {
    let scenes = preds
        .scenes
        .into_iter()
        .map(|scene| {
            scene
                .into_iter()
                .map(|p| PredictionJson {
                    label: p.label,
                    class_name: post.class_name(p.label).map(str::to_string),
                    score: p.score,
                    raw_score: p.raw_score,
                    bbox: p.bbox.to_vec(),
                    roi: p.roi.as_ref().map(|r| r.roi.to_vec()),
                    roi_raw_score: p.roi.as_ref().map(|r| r.raw_score),
                    gt_iou: p.roi.as_ref().and_then(|r| r.gt_iou),
                })
                .collect()
        })
        .collect();
    Output::Predictions {
        scenes,
        recall: preds.recall.into(),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.trace {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive("boxrefine=info".parse()?))
            .with_target(false)
            .init();
    }

    if cli.print_example {
        println!("{EXAMPLE_JSON}");
        return Ok(());
    }

    let config_text = fs::read_to_string(&cli.config)?;
    let config: Config = serde_json::from_str(&config_text)?;
    if config.input_path.is_empty() {
        return Err("input_path must be set in the config".into());
    }
    let post = PostProcessor::new(DetectorConfig::try_from(config.detector)?)?;

    let input: Input = serde_json::from_str(&fs::read_to_string(&config.input_path)?)?;
    let anchors = to_array3("anchors", input.anchors)?;
    let rpn_cls = to_array3("rpn_cls", input.rpn_cls)?;
    let rpn_box = to_array3("rpn_box", input.rpn_box)?;
    let rpn_dir = input.rpn_dir.map(|d| to_array3("rpn_dir", d)).transpose()?;
    let gt = input.gt_boxes.map(|g| to_array3("gt_boxes", g)).transpose()?;
    let rpn = RpnOutput {
        cls_preds: rpn_cls.view(),
        box_preds: rpn_box.view(),
        dir_cls_preds: rpn_dir.as_ref().map(|d| d.view()),
    };
    let gt_view = gt.as_ref().map(|g| g.view());
    let mode = ProposalMode::from(config.mode);

    let output = match config.stage {
        StageConfig::Rpn => predictions_output(&post, post.predict_rpn(anchors.view(), rpn, gt_view)?),
        StageConfig::Proposals => {
            let rois = post.propose(anchors.view(), rpn, mode)?;
            proposals_output(&post, &rois)
        }
        StageConfig::Rcnn => {
            let rcnn_cls = input.rcnn_cls.ok_or("rcnn stage needs rcnn_cls in the input")?;
            let rcnn_box = input.rcnn_box.ok_or("rcnn stage needs rcnn_box in the input")?;
            let rcnn_cls = to_array2("rcnn_cls", rcnn_cls)?;
            let rcnn_box = to_array3("rcnn_box", rcnn_box)?;
            let rois = post.propose(anchors.view(), rpn, mode)?;
            let preds = post.predict_rcnn(
                &rois,
                RcnnOutput {
                    cls_preds: rcnn_cls.view(),
                    box_preds: rcnn_box.view(),
                },
                gt_view,
            )?;
            predictions_output(&post, preds)
        }
    };

    tracing::info!(stage = ?config.stage, "done");
    let json = serde_json::to_string_pretty(&output)?;
    match config.output_path {
        Some(path) => fs::write(path, json)?,
        None => println!("{json}"),
    }

    Ok(())
}
