use chrono::NaiveDate;

/// Analysis ids with a fixed, reviewed SQL shape. The supervisor may pick
/// these instead of asking the oracle to draft SQL; the drift and calibration
/// rules they encode come from the fab knowledge notes.
pub const DETERMINISTIC_ANALYSIS_IDS: [&str; 4] = [
    "defect_drift_weekly",
    "calibration_overdue",
    "stage_wc_weekly",
    "defect_trend_range",
];

pub fn is_deterministic_analysis(action_id: &str) -> bool {
    DETERMINISTIC_ANALYSIS_IDS.contains(&action_id)
}

/// Normalizes a tool id against the configured fleet (case-insensitive);
/// unknown tools are rejected so templated SQL never interpolates free text.
pub fn sanitize_tool(raw: &str, fleet: &[String]) -> Option<String> {
    let candidate = raw.trim();
    fleet
        .iter()
        .find(|known| known.eq_ignore_ascii_case(candidate))
        .cloned()
}

pub fn parse_analysis_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Weekly defect sums per tool/recipe with drift labels. A recipe is anomalous
/// when this week differs from last week by more than 10% of the baseline;
/// K anomalous tools on one recipe label it PROCESS_DRIFT, K == 1 TOOL_DRIFT.
/// Recipes with fewer than two tools still follow the K rule as written.
pub fn sql_defect_drift_weekly(tool: &str) -> String {
    format!(
        "
WITH params AS (
  SELECT
    date('now', 'localtime') AS end_date,
    date('now', 'localtime', '-6 day') AS this_start,
    date('now', 'localtime', '-13 day') AS last_start,
    date('now', 'localtime', '-7 day') AS last_end
),
weekly AS (
  SELECT
    d.tool,
    d.recipe,
    SUM(CASE
          WHEN date(d.date) BETWEEN (SELECT this_start FROM params) AND (SELECT end_date FROM params)
          THEN d.pre_defectwise_count ELSE 0 END
    ) AS this_sum,
    SUM(CASE
          WHEN date(d.date) BETWEEN (SELECT last_start FROM params) AND (SELECT last_end FROM params)
          THEN d.pre_defectwise_count ELSE 0 END
    ) AS last_sum
  FROM defects_daily d
  GROUP BY d.tool, d.recipe
),
calc AS (
  SELECT
    tool, recipe, this_sum, last_sum,
    CASE
      WHEN last_sum > 0 THEN abs(this_sum - last_sum) * 1.0 / last_sum
      ELSE NULL
    END AS diff_pct,
    CASE
      WHEN last_sum > 0 AND abs(this_sum - last_sum) * 1.0 / last_sum > 0.10 THEN 1
      ELSE 0
    END AS is_anom
  FROM weekly
),
recipe_k AS (
  SELECT
    recipe,
    SUM(CASE WHEN is_anom = 1 THEN 1 ELSE 0 END) AS k_anom
  FROM calc
  GROUP BY recipe
),
labeled AS (
  SELECT
    c.tool,
    c.recipe,
    c.this_sum,
    c.last_sum,
    c.diff_pct,
    rk.k_anom,
    CASE
      WHEN c.last_sum = 0 THEN 'UNKNOWN_BASELINE'
      WHEN c.is_anom = 0 THEN 'STABLE'
      WHEN rk.k_anom = 1 THEN 'TOOL_DRIFT'
      ELSE 'PROCESS_DRIFT'
    END AS drift_label
  FROM calc c
  JOIN recipe_k rk USING (recipe)
),
tool_status AS (
  SELECT
    tool,
    CASE WHEN SUM(CASE WHEN drift_label='TOOL_DRIFT' THEN 1 ELSE 0 END) > 0
      THEN 'UNHEALTHY' ELSE 'HEALTHY' END AS tool_health,
    SUM(CASE WHEN drift_label='TOOL_DRIFT' THEN 1 ELSE 0 END) AS tool_drift_recipe_count,
    SUM(CASE WHEN drift_label='UNKNOWN_BASELINE' THEN 1 ELSE 0 END) AS unknown_baseline_recipe_count
  FROM labeled
  GROUP BY tool
)
SELECT
  (SELECT end_date FROM params) AS analysis_end_date,
  (SELECT this_start FROM params) AS this_week_start,
  (SELECT end_date FROM params) AS this_week_end,
  (SELECT last_start FROM params) AS last_week_start,
  (SELECT last_end FROM params) AS last_week_end,
  l.tool,
  l.recipe,
  l.this_sum AS s_this_week,
  l.last_sum AS s_last_week,
  ROUND(l.diff_pct, 4) AS diff_pct,
  l.k_anom,
  l.drift_label,
  ts.tool_health,
  ts.tool_drift_recipe_count,
  ts.unknown_baseline_recipe_count
FROM labeled l
JOIN tool_status ts ON ts.tool = l.tool
WHERE l.tool = '{tool}'
ORDER BY
  CASE l.drift_label
    WHEN 'TOOL_DRIFT' THEN 3
    WHEN 'PROCESS_DRIFT' THEN 2
    WHEN 'UNKNOWN_BASELINE' THEN 1
    ELSE 0
  END DESC,
  l.recipe ASC;
"
    )
    .trim()
    .to_string()
}

/// Calibration due dates for one tool, overdue entries first.
pub fn sql_calibration_overdue(tool: &str) -> String {
    format!(
        "
WITH params AS (
  SELECT date('now', 'localtime') AS end_date
)
SELECT
  (SELECT end_date FROM params) AS analysis_end_date,
  c.tool,
  c.subsystem,
  c.cal_name,
  c.last_cal_date,
  c.freq_days,
  date(c.last_cal_date, printf('+%d day', c.freq_days)) AS due_date,
  CASE
    WHEN date((SELECT end_date FROM params)) > date(c.last_cal_date, printf('+%d day', c.freq_days))
    THEN 1 ELSE 0
  END AS is_overdue
FROM calibrations c
WHERE c.tool = '{tool}'
ORDER BY is_overdue DESC, due_date ASC;
"
    )
    .trim()
    .to_string()
}

/// Wafer-center abnormal ratio per recipe for the current week; a point is
/// abnormal when |x| or |y| exceeds 150.
pub fn sql_stage_wc_weekly(tool: &str) -> String {
    format!(
        "
WITH params AS (
  SELECT
    date('now', 'localtime') AS end_date,
    date('now', 'localtime', '-6 day') AS this_start
)
SELECT
  (SELECT end_date FROM params) AS analysis_end_date,
  (SELECT this_start FROM params) AS this_week_start,
  (SELECT end_date FROM params) AS this_week_end,
  w.tool,
  w.recipe,
  COUNT(*) AS wc_total,
  SUM(CASE WHEN abs(w.x) > 150 OR abs(w.y) > 150 THEN 1 ELSE 0 END) AS wc_abnormal,
  ROUND(
    CASE WHEN COUNT(*) = 0 THEN 0 ELSE 1.0 * SUM(CASE WHEN abs(w.x) > 150 OR abs(w.y) > 150 THEN 1 ELSE 0 END) / COUNT(*) END,
    4
  ) AS wc_abnormal_ratio
FROM wc_points w
WHERE w.tool = '{tool}'
  AND date(w.date) BETWEEN (SELECT this_start FROM params) AND (SELECT end_date FROM params)
GROUP BY w.tool, w.recipe
ORDER BY wc_abnormal_ratio DESC, wc_total DESC, w.recipe ASC;
"
    )
    .trim()
    .to_string()
}

/// Daily defect totals for a tool over an inclusive, pre-validated date range.
pub fn sql_defect_trend_range(tool: &str, date_from: NaiveDate, date_to: NaiveDate) -> String {
    format!(
        "
SELECT
  date(d.date) AS run_date,
  d.tool,
  d.recipe,
  SUM(d.pre_defectwise_count) AS total_defects,
  COUNT(*) AS total_rows
FROM defects_daily d
WHERE d.tool = '{tool}'
  AND date(d.date) BETWEEN date('{date_from}') AND date('{date_to}')
GROUP BY date(d.date), d.tool, d.recipe
ORDER BY run_date ASC;
"
    )
    .trim()
    .to_string()
}
