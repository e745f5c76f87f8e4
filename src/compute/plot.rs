use crate::compute::pipeline::{PlotKind, PlotSpec};
use crate::compute::{io_error, ComputeError, Frame};
use crate::shared::{new_plot_id, validate_identifier_value};
use std::fs;
use std::path::{Path, PathBuf};

const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 400.0;
const MARGIN_LEFT: f64 = 56.0;
const MARGIN_RIGHT: f64 = 16.0;
const MARGIN_TOP: f64 = 36.0;
const MARGIN_BOTTOM: f64 = 48.0;
const MAX_X_LABELS: usize = 8;

/// Renders one chart to an SVG file under `cache_dir` and returns its path.
/// Plot files are the computation executor's only write surface.
pub fn render_plot(
    spec: &PlotSpec,
    frame: &Frame,
    cache_dir: &Path,
) -> Result<PathBuf, ComputeError> {
    let series = paired_series(frame, &spec.x, &spec.y)?;
    if series.is_empty() {
        return Err(ComputeError::Plot(format!(
            "no numeric values in column `{}` to plot",
            spec.y
        )));
    }

    let plot_id = match spec.name.as_deref() {
        Some(name) => {
            validate_identifier_value("plot name", name).map_err(ComputeError::Plot)?;
            name.to_string()
        }
        None => new_plot_id().map_err(ComputeError::Plot)?,
    };

    let svg = match spec.kind {
        PlotKind::Line => render_line_svg(spec, &series),
        PlotKind::Bar => render_bar_svg(spec, &series),
    };

    fs::create_dir_all(cache_dir).map_err(|source| io_error(cache_dir, source))?;
    let path = cache_dir.join(format!("{plot_id}.svg"));
    fs::write(&path, svg).map_err(|source| io_error(&path, source))?;
    Ok(path)
}

/// Pairs x labels with numeric y values, skipping rows where y is not a
/// number so gaps in the data never corrupt the geometry.
fn paired_series(frame: &Frame, x: &str, y: &str) -> Result<Vec<(String, f64)>, ComputeError> {
    let x_idx = frame.column_index(x)?;
    let y_idx = frame.column_index(y)?;
    Ok(frame
        .rows
        .iter()
        .filter_map(|row| {
            let value = row.get(y_idx)?.as_num()?;
            let label = row.get(x_idx).map(|cell| cell.render()).unwrap_or_default();
            Some((label, value))
        })
        .collect())
}

struct Scale {
    y_min: f64,
    y_max: f64,
}

impl Scale {
    fn from_values(values: impl Iterator<Item = f64>) -> Self {
        let mut y_min = f64::INFINITY;
        let mut y_max = f64::NEG_INFINITY;
        for value in values {
            y_min = y_min.min(value);
            y_max = y_max.max(value);
        }
        // Anchor at zero for all-positive data; pad flat series.
        if y_min > 0.0 {
            y_min = 0.0;
        }
        if (y_max - y_min).abs() < f64::EPSILON {
            y_max = y_min + 1.0;
        }
        Self { y_min, y_max }
    }

    fn project(&self, value: f64) -> f64 {
        let span = self.y_max - self.y_min;
        let plot_height = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
        MARGIN_TOP + plot_height * (1.0 - (value - self.y_min) / span)
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn format_tick(value: f64) -> String {
    if value.abs() >= 100.0 || value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

fn svg_header(title: Option<&str>) -> String {
    let mut svg = format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{WIDTH}\" height=\"{HEIGHT}\" viewBox=\"0 0 {WIDTH} {HEIGHT}\">\n\
         <rect width=\"{WIDTH}\" height=\"{HEIGHT}\" fill=\"white\"/>\n"
    );
    if let Some(title) = title {
        svg.push_str(&format!(
            "<text x=\"{}\" y=\"22\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"14\">{}</text>\n",
            WIDTH / 2.0,
            escape_xml(title)
        ));
    }
    svg
}

fn svg_axes_and_ticks(scale: &Scale) -> String {
    let x_axis_y = HEIGHT - MARGIN_BOTTOM;
    let mut svg = format!(
        "<line x1=\"{MARGIN_LEFT}\" y1=\"{MARGIN_TOP}\" x2=\"{MARGIN_LEFT}\" y2=\"{x_axis_y}\" stroke=\"black\"/>\n\
         <line x1=\"{MARGIN_LEFT}\" y1=\"{x_axis_y}\" x2=\"{}\" y2=\"{x_axis_y}\" stroke=\"black\"/>\n",
        WIDTH - MARGIN_RIGHT
    );
    for tick in 0..=4 {
        let value = scale.y_min + (scale.y_max - scale.y_min) * f64::from(tick) / 4.0;
        let y = scale.project(value);
        svg.push_str(&format!(
            "<line x1=\"{}\" y1=\"{y}\" x2=\"{}\" y2=\"{y}\" stroke=\"#cccccc\" stroke-dasharray=\"2,3\"/>\n\
             <text x=\"{}\" y=\"{}\" text-anchor=\"end\" font-family=\"sans-serif\" font-size=\"10\">{}</text>\n",
            MARGIN_LEFT,
            WIDTH - MARGIN_RIGHT,
            MARGIN_LEFT - 6.0,
            y + 3.0,
            format_tick(value)
        ));
    }
    svg
}

fn svg_x_labels(labels: &[&str], positions: &[f64]) -> String {
    let stride = labels.len().div_ceil(MAX_X_LABELS).max(1);
    let mut svg = String::new();
    for (idx, (label, x)) in labels.iter().zip(positions).enumerate() {
        if idx % stride != 0 {
            continue;
        }
        svg.push_str(&format!(
            "<text x=\"{x}\" y=\"{}\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"10\">{}</text>\n",
            HEIGHT - MARGIN_BOTTOM + 16.0,
            escape_xml(label)
        ));
    }
    svg
}

fn render_line_svg(spec: &PlotSpec, series: &[(String, f64)]) -> String {
    let scale = Scale::from_values(series.iter().map(|(_, v)| *v));
    let plot_width = WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let step = if series.len() > 1 {
        plot_width / (series.len() - 1) as f64
    } else {
        0.0
    };
    let positions: Vec<f64> = (0..series.len())
        .map(|idx| MARGIN_LEFT + step * idx as f64)
        .collect();

    let points: Vec<String> = series
        .iter()
        .zip(&positions)
        .map(|((_, value), x)| format!("{x:.1},{:.1}", scale.project(*value)))
        .collect();

    let labels: Vec<&str> = series.iter().map(|(label, _)| label.as_str()).collect();
    let mut svg = svg_header(spec.title.as_deref());
    svg.push_str(&svg_axes_and_ticks(&scale));
    svg.push_str(&format!(
        "<polyline points=\"{}\" fill=\"none\" stroke=\"#1f77b4\" stroke-width=\"2\"/>\n",
        points.join(" ")
    ));
    for point in &points {
        let (x, y) = point.split_once(',').unwrap_or(("0", "0"));
        svg.push_str(&format!(
            "<circle cx=\"{x}\" cy=\"{y}\" r=\"3\" fill=\"#1f77b4\"/>\n"
        ));
    }
    svg.push_str(&svg_x_labels(&labels, &positions));
    svg.push_str("</svg>\n");
    svg
}

fn render_bar_svg(spec: &PlotSpec, series: &[(String, f64)]) -> String {
    let scale = Scale::from_values(series.iter().map(|(_, v)| *v));
    let plot_width = WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let slot = plot_width / series.len() as f64;
    let bar_width = (slot * 0.7).max(1.0);
    let baseline = scale.project(scale.y_min.max(0.0));

    let positions: Vec<f64> = (0..series.len())
        .map(|idx| MARGIN_LEFT + slot * (idx as f64 + 0.5))
        .collect();

    let labels: Vec<&str> = series.iter().map(|(label, _)| label.as_str()).collect();
    let mut svg = svg_header(spec.title.as_deref());
    svg.push_str(&svg_axes_and_ticks(&scale));
    for ((_, value), center) in series.iter().zip(&positions) {
        let top = scale.project(*value).min(baseline);
        let height = (scale.project(*value) - baseline).abs();
        svg.push_str(&format!(
            "<rect x=\"{:.1}\" y=\"{top:.1}\" width=\"{bar_width:.1}\" height=\"{height:.1}\" fill=\"#ff7f0e\"/>\n",
            center - bar_width / 2.0
        ));
    }
    svg.push_str(&svg_x_labels(&labels, &positions));
    svg.push_str("</svg>\n");
    svg
}
