//! Motion and timing planner
//!
//! Turns one [`Command`] into a deterministic list of [`Step`]s. The planner
//! never sleeps itself; the session executes the plan. The only state kept
//! between commands is the set of held mouse buttons, which every mouse
//! report carries.

use std::time::Duration;
use tracing::{debug, warn};

use crate::command::{Command, MouseButton};
use crate::config::TimingConfig;
use crate::hid::{
    ComboKey, KeyMap, KeyStroke, KeyboardReport, Modifiers, MouseButtons, MouseReport, Report,
    AXIS_LIMIT, MOVE_LIMIT,
};

/// One unit of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Emit(Report),
    Wait(Duration),
}

/// Ordered steps for one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Reports in emission order
    pub fn reports(&self) -> impl Iterator<Item = &Report> + '_ {
        self.steps.iter().filter_map(|s| match s {
            Step::Emit(r) => Some(r),
            Step::Wait(_) => None,
        })
    }

    pub fn report_count(&self) -> usize {
        self.reports().count()
    }

    /// Sum of all waits
    pub fn total_delay(&self) -> Duration {
        self.steps
            .iter()
            .filter_map(|s| match s {
                Step::Wait(d) => Some(*d),
                Step::Emit(_) => None,
            })
            .sum()
    }

    fn emit(&mut self, report: Report) {
        self.steps.push(Step::Emit(report));
    }

    fn mouse(&mut self, report: MouseReport) {
        self.emit(Report::Mouse(report));
    }

    fn keyboard(&mut self, report: KeyboardReport) {
        self.emit(Report::Keyboard(report));
    }

    /// Zero-length waits are omitted
    fn wait_ms(&mut self, ms: u64) {
        if ms > 0 {
            self.steps.push(Step::Wait(Duration::from_millis(ms)));
        }
    }
}

impl IntoIterator for Plan {
    type Item = Step;
    type IntoIter = std::vec::IntoIter<Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.into_iter()
    }
}

/// Gesture planner
#[derive(Debug, Clone)]
pub struct Planner {
    timing: TimingConfig,
    combo_modifiers: Modifiers,
    held: MouseButtons,
}

impl Planner {
    pub fn new(timing: TimingConfig, combo_modifiers: Modifiers) -> Self {
        Self {
            timing,
            combo_modifiers,
            held: MouseButtons::empty(),
        }
    }

    #[cfg(test)]
    fn held_buttons(&self) -> MouseButtons {
        self.held
    }

    /// Forget held buttons, e.g. after the peer went away
    pub fn reset(&mut self) {
        self.held = MouseButtons::empty();
    }

    /// Reports that put both collections back to the all-up state
    pub fn release_all(&mut self) -> Plan {
        self.reset();
        let mut plan = Plan::default();
        plan.keyboard(KeyboardReport::released());
        plan.mouse(MouseReport::released());
        plan
    }

    pub fn plan(&mut self, command: &Command) -> Plan {
        let mut plan = Plan::default();

        match command {
            Command::Tap { x, y } => self.tap(&mut plan, *x, *y),
            Command::DoubleTap { x, y } => {
                self.tap(&mut plan, *x, *y);
                plan.wait_ms(self.timing.double_tap_gap_ms);
                self.press_settle_release(&mut plan);
            }
            Command::Swipe { dx, dy } => self.swipe(&mut plan, *dx, *dy),
            Command::Type(text) => self.type_text(&mut plan, text),
            Command::KeyCombo(ComboKey::Named(stroke)) => self.combo(&mut plan, *stroke),
            Command::KeyCombo(ComboKey::Char(stroke)) => {
                let stroke = KeyStroke::new(
                    self.combo_modifiers.union(stroke.modifiers),
                    stroke.keycode,
                );
                self.combo(&mut plan, stroke);
            }
            Command::KeyComboSpecial(code) => {
                self.combo(&mut plan, KeyStroke::new(self.combo_modifiers, *code))
            }
            Command::MouseMove { dx, dy } => self.moves(&mut plan, *dx, *dy),
            Command::MouseClick(button) => self.click(&mut plan, *button),
            Command::MousePress(button) => {
                self.held.insert(button.mask());
                plan.mouse(MouseReport::buttons(self.held));
            }
            Command::MouseRelease(button) => {
                self.held.remove(button.mask());
                plan.mouse(MouseReport::buttons(self.held));
            }
            Command::Scroll { dx, dy } => {
                if *dx != 0 {
                    warn!("Horizontal scroll not supported, ignoring dx={}", dx);
                }
                plan.mouse(MouseReport::new(self.held, 0, 0, *dy));
            }
            Command::Ping => {}
        }

        debug!(
            "Planned {}: {} reports, {:?} of delays",
            command.verb(),
            plan.report_count(),
            plan.total_delay()
        );
        plan
    }

    fn tap(&mut self, plan: &mut Plan, x: f64, y: f64) {
        let dx = ((x - 0.5) * self.timing.tap_scale).round() as i32;
        let dy = ((y - 0.5) * self.timing.tap_scale).round() as i32;
        self.moves(plan, dx, dy);
        self.press_settle_release(plan);
    }

    fn press_settle_release(&mut self, plan: &mut Plan) {
        plan.mouse(MouseReport::buttons(self.held.union(MouseButtons::LEFT)));
        plan.wait_ms(self.timing.tap_settle_ms);
        plan.mouse(MouseReport::buttons(self.held));
    }

    /// Relative move split into reports no larger than the axis range
    ///
    /// The total is capped at [`MOVE_LIMIT`] per axis.
    fn moves(&mut self, plan: &mut Plan, dx: i32, dy: i32) {
        let (mut rx, mut ry) = (
            dx.clamp(-MOVE_LIMIT, MOVE_LIMIT),
            dy.clamp(-MOVE_LIMIT, MOVE_LIMIT),
        );
        if (rx, ry) != (dx, dy) {
            warn!("Move ({}, {}) capped to ({}, {})", dx, dy, rx, ry);
        }
        while rx != 0 || ry != 0 {
            let sx = rx.clamp(-AXIS_LIMIT, AXIS_LIMIT);
            let sy = ry.clamp(-AXIS_LIMIT, AXIS_LIMIT);
            plan.mouse(MouseReport::new(self.held, sx, sy, 0));
            rx -= sx;
            ry -= sy;
        }
    }

    fn swipe(&mut self, plan: &mut Plan, dx: f64, dy: f64) {
        let step_dx = (dx * self.timing.swipe_scale).round() as i32;
        let step_dy = (dy * self.timing.swipe_scale).round() as i32;
        let drag = self.timing.swipe_drag && !self.held.contains(MouseButtons::LEFT);
        let buttons = if drag {
            self.held.union(MouseButtons::LEFT)
        } else {
            self.held
        };

        if drag {
            plan.mouse(MouseReport::buttons(buttons));
        }

        for step in 0..self.timing.swipe_steps {
            if step > 0 {
                plan.wait_ms(self.timing.swipe_step_delay_ms);
            }
            plan.mouse(MouseReport::new(buttons, step_dx, step_dy, 0));
        }

        if drag {
            plan.mouse(MouseReport::buttons(self.held));
        }
    }

    fn type_text(&mut self, plan: &mut Plan, text: &str) {
        for c in text.chars() {
            let Some(stroke) = KeyMap::char_stroke(c) else {
                debug!("Skipping unmappable character {:?}", c);
                continue;
            };
            plan.keyboard(KeyboardReport::key(stroke.modifiers, stroke.keycode));
            plan.wait_ms(self.timing.type_key_hold_ms);
            plan.keyboard(KeyboardReport::released());
            plan.wait_ms(self.timing.type_char_delay_ms);
        }
    }

    /// Modifiers one at a time in bit order, then the key, then release-all
    fn combo(&mut self, plan: &mut Plan, stroke: KeyStroke) {
        let mut accumulated = Modifiers::empty();
        for modifier in stroke.modifiers.iter() {
            accumulated.insert(modifier);
            plan.keyboard(KeyboardReport::modifiers(accumulated));
            plan.wait_ms(self.timing.combo_modifier_delay_ms);
        }
        plan.keyboard(KeyboardReport::key(stroke.modifiers, stroke.keycode));
        plan.wait_ms(self.timing.combo_hold_ms);
        plan.keyboard(KeyboardReport::released());
    }

    fn click(&mut self, plan: &mut Plan, button: MouseButton) {
        let mask = button.mask();
        plan.mouse(MouseReport::buttons(self.held.union(mask)));
        plan.wait_ms(self.timing.click_hold_ms);
        self.held.remove(mask);
        plan.mouse(MouseReport::buttons(self.held));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::parse;
    use crate::hid::keycodes;

    fn planner() -> Planner {
        Planner::new(
            TimingConfig::default(),
            Modifiers::LEFT_CTRL.union(Modifiers::LEFT_ALT),
        )
    }

    fn plan_line(planner: &mut Planner, line: &str) -> Plan {
        let command = parse(line).unwrap().unwrap();
        planner.plan(&command)
    }

    fn mouse_reports(plan: &Plan) -> Vec<MouseReport> {
        plan.reports()
            .map(|r| match r {
                Report::Mouse(m) => *m,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    fn keyboard_reports(plan: &Plan) -> Vec<KeyboardReport> {
        plan.reports()
            .map(|r| match r {
                Report::Keyboard(k) => *k,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_centred_tap() {
        let plan = plan_line(&mut planner(), "TAP 0.5 0.5");
        let reports = mouse_reports(&plan);
        assert_eq!(
            reports,
            vec![
                MouseReport::buttons(MouseButtons::LEFT),
                MouseReport::released()
            ]
        );
        assert_eq!(plan.total_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_tap_displacement() {
        for (x, y) in [(0.0, 1.0), (0.25, 0.75), (0.999, 0.001), (0.5, 0.1)] {
            let plan = planner().plan(&Command::Tap { x, y });
            let reports = mouse_reports(&plan);
            let (dx, dy) = (
                ((x - 0.5) * 200.0).round() as i8,
                ((y - 0.5) * 200.0).round() as i8,
            );

            assert_eq!(reports.len(), 3);
            assert_eq!((reports[0].dx, reports[0].dy), (dx, dy));
            assert!(reports[0].buttons.is_empty());
            assert_eq!(reports[1].buttons, MouseButtons::LEFT);
            assert_eq!((reports[1].dx, reports[1].dy), (0, 0));
            assert!(reports[2].buttons.is_empty());
        }
    }

    #[test]
    fn test_double_tap_repeats_press_without_moving() {
        let plan = plan_line(&mut planner(), "DOUBLE_TAP 1 1");
        let reports = mouse_reports(&plan);
        assert_eq!(reports.len(), 5);
        assert_eq!((reports[0].dx, reports[0].dy), (100, 100));
        assert_eq!(reports[3], MouseReport::buttons(MouseButtons::LEFT));
        assert_eq!(reports[4], MouseReport::released());
        assert_eq!(plan.total_delay(), Duration::from_millis(50 + 100 + 50));
    }

    #[test]
    fn test_swipe_steps() {
        let plan = plan_line(&mut planner(), "SWIPE 0.5 -1.26");
        let reports = mouse_reports(&plan);
        assert_eq!(reports.len(), 15);
        assert!(reports.iter().all(|r| r.dx == 5 && r.dy == -13));

        let total: i32 = reports.iter().map(|r| i32::from(r.dy)).sum();
        assert_eq!(total, 15 * -13);
        assert_eq!(plan.total_delay(), Duration::from_millis(14 * 20));
    }

    #[test]
    fn test_swipe_drag_holds_left_button() {
        let timing = TimingConfig {
            swipe_drag: true,
            ..TimingConfig::default()
        };
        let mut planner = Planner::new(timing, Modifiers::empty());
        let plan = plan_line(&mut planner, "SWIPE 1 0");
        let reports = mouse_reports(&plan);

        assert_eq!(reports.len(), 17);
        assert_eq!(reports[0], MouseReport::buttons(MouseButtons::LEFT));
        assert!(reports[1..16].iter().all(|r| r.buttons == MouseButtons::LEFT));
        assert_eq!(reports[16], MouseReport::released());
    }

    #[test]
    fn test_type_reports() {
        let plan = plan_line(&mut planner(), "TYPE Hi");
        let reports = keyboard_reports(&plan);
        assert_eq!(
            reports,
            vec![
                KeyboardReport::key(Modifiers::LEFT_SHIFT, keycodes::KEY_H),
                KeyboardReport::released(),
                KeyboardReport::key(Modifiers::empty(), keycodes::KEY_H + 1),
                KeyboardReport::released(),
            ]
        );
    }

    #[test]
    fn test_type_skips_unmappable() {
        let plan = plan_line(&mut planner(), "TYPE añb€");
        assert_eq!(plan.report_count(), 4);
    }

    #[test]
    fn test_type_hold_from_gadget_preset() {
        let mut planner = Planner::new(TimingConfig::gadget(), Modifiers::empty());
        let plan = plan_line(&mut planner, "TYPE ab");
        assert_eq!(plan.total_delay(), Duration::from_millis(2 * (40 + 20)));
    }

    #[test]
    fn test_key_combo_order() {
        let plan = plan_line(&mut planner(), "KEY_COMBO rotor_next");
        let reports = keyboard_reports(&plan);
        let all = Modifiers::from_bits_retain(0x0D);

        assert_eq!(
            reports,
            vec![
                KeyboardReport::modifiers(Modifiers::from_bits_retain(0x01)),
                KeyboardReport::modifiers(Modifiers::from_bits_retain(0x05)),
                KeyboardReport::modifiers(all),
                KeyboardReport::key(all, keycodes::KEY_RIGHT_ARROW),
                KeyboardReport::released(),
            ]
        );
        assert_eq!(plan.total_delay(), Duration::from_millis(3 * 10 + 100));
    }

    #[test]
    fn test_key_combo_char_uses_combo_modifiers() {
        let plan = plan_line(&mut planner(), "KEY_COMBO H");
        let reports = keyboard_reports(&plan);
        let expected = Modifiers::from_bits_retain(0x07);
        assert_eq!(reports[3], KeyboardReport::key(expected, keycodes::KEY_H));
        assert_eq!(reports.last(), Some(&KeyboardReport::released()));
    }

    #[test]
    fn test_key_combo_special() {
        let plan = plan_line(&mut planner(), "KEY_COMBO_SPECIAL 0x28");
        let reports = keyboard_reports(&plan);
        assert_eq!(reports.len(), 4);
        assert_eq!(
            reports[2],
            KeyboardReport::key(Modifiers::from_bits_retain(0x05), keycodes::KEY_ENTER)
        );
    }

    #[test]
    fn test_named_key_without_modifiers() {
        let plan = plan_line(&mut planner(), "KEY_COMBO back");
        let reports = keyboard_reports(&plan);
        assert_eq!(
            reports,
            vec![
                KeyboardReport::key(Modifiers::empty(), keycodes::KEY_ESCAPE),
                KeyboardReport::released(),
            ]
        );
    }

    #[test]
    fn test_mouse_move_is_split() {
        let plan = plan_line(&mut planner(), "MOUSE_MOVE 300 -20");
        let reports = mouse_reports(&plan);
        assert_eq!(reports.len(), 3);
        assert_eq!((reports[0].dx, reports[0].dy), (127, -20));
        assert_eq!((reports[1].dx, reports[1].dy), (127, 0));
        assert_eq!((reports[2].dx, reports[2].dy), (46, 0));
    }

    #[test]
    fn test_tap_move_is_capped() {
        let timing = TimingConfig {
            tap_scale: 1.0e9,
            ..TimingConfig::default()
        };
        let mut planner = Planner::new(timing, Modifiers::empty());
        let plan = plan_line(&mut planner, "TAP 1 0");
        let reports = mouse_reports(&plan);
        let moves = &reports[..reports.len() - 2];
        assert_eq!(moves.len(), (MOVE_LIMIT / AXIS_LIMIT) as usize);
        let total_dx: i32 = moves.iter().map(|r| i32::from(r.dx)).sum();
        assert_eq!(total_dx, MOVE_LIMIT);
    }

    #[test]
    fn test_escaped_newline_types_enter() {
        let plan = plan_line(&mut planner(), "TYPE a\\nb");
        let reports = keyboard_reports(&plan);
        assert_eq!(reports.len(), 6);
        assert_eq!(reports[2].keys[0], keycodes::KEY_ENTER);
    }

    #[test]
    fn test_press_state_carried_by_moves() {
        let mut planner = planner();
        plan_line(&mut planner, "MOUSE_PRESS left");
        assert_eq!(planner.held_buttons(), MouseButtons::LEFT);

        let plan = plan_line(&mut planner, "m:5,5");
        assert_eq!(mouse_reports(&plan)[0].buttons, MouseButtons::LEFT);

        let plan = plan_line(&mut planner, "MOUSE_RELEASE left");
        assert_eq!(mouse_reports(&plan), vec![MouseReport::released()]);
        assert!(planner.held_buttons().is_empty());
    }

    #[test]
    fn test_click() {
        let plan = plan_line(&mut planner(), "MOUSE_CLICK right");
        assert_eq!(
            mouse_reports(&plan),
            vec![
                MouseReport::buttons(MouseButtons::RIGHT),
                MouseReport::released()
            ]
        );
        assert_eq!(plan.total_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_scroll() {
        let plan = plan_line(&mut planner(), "SCROLL 0 1");
        assert_eq!(mouse_reports(&plan), vec![MouseReport::new(MouseButtons::empty(), 0, 0, 1)]);

        let plan = plan_line(&mut planner(), "SCROLL 4 -2");
        assert_eq!(mouse_reports(&plan)[0].wheel, -2);
        assert_eq!(mouse_reports(&plan)[0].dx, 0);
    }

    #[test]
    fn test_ping_and_fast_preset() {
        assert!(plan_line(&mut planner(), "PING").is_empty());

        let mut fast = Planner::new(TimingConfig::fast(), Modifiers::empty());
        let plan = plan_line(&mut fast, "DOUBLE_TAP 0.2 0.2");
        assert_eq!(plan.total_delay(), Duration::ZERO);
        assert!(plan.steps().iter().all(|s| matches!(s, Step::Emit(_))));
    }

    #[test]
    fn test_release_all_clears_held_buttons() {
        let mut planner = planner();
        plan_line(&mut planner, "MOUSE_PRESS middle");
        let plan = planner.release_all();
        assert_eq!(plan.report_count(), 2);
        assert!(planner.held_buttons().is_empty());
    }
}
