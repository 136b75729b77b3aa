//! Loss curves rendered to SVG with `plotters`.
//!
//! Layout: one wide panel for the total loss on top, triplet and GN panels
//! side by side below. Each panel overlays train (blue) and validation
//! (orange). Rendering is stateless: the whole history is redrawn each call.

use std::ops::Range;
use std::path::Path;

use plotters::coord::Shift;
use plotters::drawing::DrawingAreaErrorKind;
use plotters::prelude::*;

use crate::error::TrainError;
use crate::training::sink::{
    ScalarRecord, TRAIN_GN_LOSS, TRAIN_TOTAL_LOSS, TRAIN_TRIPLET_LOSS, VAL_GN_LOSS, VAL_TOTAL_LOSS,
    VAL_TRIPLET_LOSS,
};

const SIZE: (u32, u32) = (900, 640);
/// Height of the total-loss panel and width of the triplet panel.
const TOP_HEIGHT: i32 = 320;
const LEFT_WIDTH: i32 = 450;
const TRAIN_COLOR: RGBColor = RGBColor(31, 119, 180);
const VAL_COLOR: RGBColor = RGBColor(255, 127, 14);

/// One loss series; `epochs` holds 1-based x positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossSeries {
    pub epochs: Vec<f64>,
    pub total: Vec<f64>,
    pub triplet: Vec<f64>,
    pub gn: Vec<f64>,
}

impl LossSeries {
    /// Record the means of zero-based `epoch`.
    pub fn push(&mut self, epoch: usize, total: f64, triplet: f64, gn: f64) {
        self.epochs.push((epoch + 1) as f64);
        self.total.push(total);
        self.triplet.push(triplet);
        self.gn.push(gn);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

/// Train and validation series of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossHistory {
    pub train: LossSeries,
    pub val: LossSeries,
}

impl LossHistory {
    /// Rebuild the history of epochs before `before_epoch` from logged
    /// scalars. Epochs missing any of the three terms are skipped.
    pub fn from_scalars(records: &[ScalarRecord], before_epoch: i64) -> Self {
        let series = |tags: [&str; 3]| {
            let mut out = LossSeries::default();
            let mut epochs: Vec<i64> = records
                .iter()
                .filter(|r| r.tag == tags[0] && r.epoch >= 0 && r.epoch < before_epoch)
                .map(|r| r.epoch)
                .collect();
            epochs.sort_unstable();
            epochs.dedup();
            for epoch in epochs {
                let value = |tag: &str| {
                    records
                        .iter()
                        .rev()
                        .find(|r| r.tag == tag && r.epoch == epoch)
                        .map(|r| r.value)
                };
                if let (Some(total), Some(triplet), Some(gn)) =
                    (value(tags[0]), value(tags[1]), value(tags[2]))
                {
                    out.push(epoch as usize, total, triplet, gn);
                }
            }
            out
        };
        Self {
            train: series([TRAIN_TOTAL_LOSS, TRAIN_TRIPLET_LOSS, TRAIN_GN_LOSS]),
            val: series([VAL_TOTAL_LOSS, VAL_TRIPLET_LOSS, VAL_GN_LOSS]),
        }
    }
}

fn plot_err<E: std::error::Error + Send + Sync>(err: DrawingAreaErrorKind<E>) -> TrainError {
    TrainError::Plot(err.to_string())
}

/// Finite `(x, y)` points of one curve.
fn points(epochs: &[f64], values: &[f64]) -> Vec<(f64, f64)> {
    epochs
        .iter()
        .zip(values)
        .filter(|(_, v)| v.is_finite())
        .map(|(&x, &y)| (x, y))
        .collect()
}

/// Data range over every point, widened when all values coincide.
fn axis_range(values: impl Iterator<Item = f64>) -> Option<Range<f64>> {
    let (lo, hi) = values.fold(None, |acc: Option<(f64, f64)>, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })?;
    if (hi - lo).abs() < 1e-12 {
        let pad = if lo.abs() > 1e-12 { lo.abs() * 0.1 } else { 1.0 };
        Some(lo - pad..hi + pad)
    } else {
        let pad = (hi - lo) * 0.05;
        Some(lo - pad..hi + pad)
    }
}

fn draw_panel<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    title: &str,
    train: Vec<(f64, f64)>,
    val: Vec<(f64, f64)>,
) -> crate::Result<()> {
    let all = || train.iter().chain(val.iter());
    let ranges = (
        axis_range(all().map(|p| p.0)),
        axis_range(all().map(|p| p.1)),
    );
    let (Some(xs), Some(ys)) = ranges else {
        let mut chart = ChartBuilder::on(area)
            .margin(10)
            .caption(title, ("sans-serif", 18))
            .build_cartesian_2d(0.0..1.0, 0.0..1.0)
            .map_err(plot_err)?;
        chart
            .draw_series(std::iter::once(Text::new(
                "no data",
                (0.45, 0.5),
                ("sans-serif", 14),
            )))
            .map_err(plot_err)?;
        return Ok(());
    };

    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .caption(title, ("sans-serif", 18))
        .x_label_area_size(30)
        .y_label_area_size(60)
        .build_cartesian_2d(xs, ys)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .x_desc("epoch")
        .y_label_formatter(&|v| format!("{v:.4}"))
        .draw()
        .map_err(plot_err)?;

    for (label, color, curve) in [("train", TRAIN_COLOR, train), ("val", VAL_COLOR, val)] {
        if curve.is_empty() {
            continue;
        }
        chart
            .draw_series(LineSeries::new(curve.clone(), color.stroke_width(2)))
            .map_err(plot_err)?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
        chart
            .draw_series(curve.into_iter().map(|p| Circle::new(p, 3, color.filled())))
            .map_err(plot_err)?;
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)?;
    Ok(())
}

/// Render the three-panel loss figure.
pub fn render_loss_svg(history: &LossHistory) -> crate::Result<String> {
    let (train, val) = (&history.train, &history.val);
    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let (top, bottom) = root.split_vertically(TOP_HEIGHT);
        let (left, right) = bottom.split_horizontally(LEFT_WIDTH);

        draw_panel(
            &top,
            "Total loss",
            points(&train.epochs, &train.total),
            points(&val.epochs, &val.total),
        )?;
        draw_panel(
            &left,
            "Triplet loss",
            points(&train.epochs, &train.triplet),
            points(&val.epochs, &val.triplet),
        )?;
        draw_panel(
            &right,
            "GN loss",
            points(&train.epochs, &train.gn),
            points(&val.epochs, &val.gn),
        )?;
        root.present().map_err(plot_err)?;
    }
    Ok(svg)
}

/// Overwrite `path` with the current figure.
pub fn write_loss_plot(path: &Path, history: &LossHistory) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_loss_svg(history)?)?;
    Ok(())
}
