//! Lowers the parse tree to the flat instruction array and label table.
//!
//! Compilation is two passes: a depth-first flattening pass that emits
//! instructions and records side lists (called labels, referenced
//! images), then a pass over the finished array that builds the label
//! table. Forward references are therefore legal; resolving them is the
//! job of the explicitly invoked [`CompiledProgram::validate`].

use std::collections::{HashMap, HashSet};
use std::path::Path;

use thiserror::Error;

use crate::ast::{Arg, ArgKind, Node, RuleKind, Tree};
use crate::backend::resolve_image;
use crate::program::{Command, Conditional, Instruction, Opcode, Operand, Program};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Invalid tree passed: expected '{expected}', got '{got}'")]
    UnexpectedRule { expected: String, got: String },

    #[error("Malformed '{rule}' node in parse tree")]
    MalformedNode { rule: &'static str },

    #[error("Invalid {what} '{text}'")]
    InvalidArgument { what: &'static str, text: String },

    #[error("Label '{0}' is already in use")]
    DuplicateLabel(String),

    #[error("At least one macro must be defined")]
    NoMacroDefined,

    #[error("Label '{0}' is not defined")]
    UndefinedLabel(String),

    #[error(
        "Image '{0}' not found: put images inside the 'images' directory next \
         to the macro file or use absolute paths"
    )]
    MissingImage(String),
}

/// Flattened program plus the link information needed for the optional
/// validation pass. The compiler itself never touches the filesystem.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub program: Program,
    called_labels: Vec<String>,
    images: Vec<String>,
}

impl CompiledProgram {
    /// Full-checks pass: every referenced label resolves and every
    /// referenced image file exists relative to `base_dir`.
    pub fn validate(&self, base_dir: &Path) -> Result<(), CompileError> {
        self.check_labels()?;
        self.check_images(base_dir)
    }

    pub fn check_labels(&self) -> Result<(), CompileError> {
        for label in &self.called_labels {
            if !self.program.labels.contains_key(label) {
                return Err(CompileError::UndefinedLabel(label.clone()));
            }
        }
        Ok(())
    }

    pub fn check_images(&self, base_dir: &Path) -> Result<(), CompileError> {
        for image in &self.images {
            if !resolve_image(base_dir, image).exists() {
                return Err(CompileError::MissingImage(image.clone()));
            }
        }
        Ok(())
    }

    pub fn into_program(self) -> Program {
        self.program
    }
}

pub fn compile(tree: &Tree) -> Result<CompiledProgram, CompileError> {
    let mut compiler = Compiler::default();
    compiler.lower_start(tree)?;

    if !compiler.macro_defined {
        return Err(CompileError::NoMacroDefined);
    }

    let labels = compiler.label_table();
    Ok(CompiledProgram {
        program: Program {
            instructions: compiler.instructions,
            labels,
        },
        called_labels: compiler.called_labels,
        images: compiler.images,
    })
}

/// `"42m"` → 2520. Durations carry a mandatory `s`/`m`/`h` suffix.
pub fn duration_seconds(text: &str) -> Result<u64, CompileError> {
    let invalid = || CompileError::InvalidArgument {
        what: "duration",
        text: text.to_string(),
    };

    let (number, suffix) = text.split_at(text.len().saturating_sub(1));
    let value: u64 = number.parse().map_err(|_| invalid())?;
    let scale = match suffix {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(invalid()),
    };
    value.checked_mul(scale).ok_or_else(invalid)
}

/// `"10,20"` → (10, 20).
pub fn coordinates(text: &str) -> Result<(i32, i32), CompileError> {
    let invalid = || CompileError::InvalidArgument {
        what: "coordinates",
        text: text.to_string(),
    };

    let (x, y) = text.split_once(',').ok_or_else(invalid)?;
    let x = x.trim().parse().map_err(|_| invalid())?;
    let y = y.trim().parse().map_err(|_| invalid())?;
    Ok((x, y))
}

#[derive(Default)]
struct Compiler {
    instructions: Vec<Instruction>,
    defined_labels: HashSet<String>,
    called_labels: Vec<String>,
    images: Vec<String>,
    macro_defined: bool,
    next_branch: u32,
}

impl Compiler {
    fn lower_start(&mut self, tree: &Tree) -> Result<(), CompileError> {
        expect_kind(tree, RuleKind::Start)?;
        for child in &tree.children {
            self.lower_unit(rule_node(child, RuleKind::Start)?)?;
        }
        Ok(())
    }

    fn lower_unit(&mut self, tree: &Tree) -> Result<(), CompileError> {
        let is_macro = match tree.kind {
            RuleKind::Macro => true,
            RuleKind::Procedure => false,
            other => {
                return Err(CompileError::UnexpectedRule {
                    expected: "macro' or 'procedure".to_string(),
                    got: other.name().to_string(),
                });
            }
        };

        let name = arg_text(child_arg(tree, 0)?, ArgKind::Name)?;
        self.define_label(&name)?;
        self.instructions.push(Instruction::Command(Command::label(name)));

        self.lower_body(child_rule(tree, 1)?)?;

        // A macro's slice ends with END, a procedure's with RETURN.
        let terminator = if is_macro { Opcode::End } else { Opcode::Return };
        self.instructions
            .push(Instruction::Command(Command::bare(terminator)));
        if is_macro {
            self.macro_defined = true;
        }
        Ok(())
    }

    fn lower_body(&mut self, tree: &Tree) -> Result<(), CompileError> {
        expect_kind(tree, RuleKind::Body)?;
        for child in &tree.children {
            let item = rule_node(child, RuleKind::Body)?;
            match item.kind {
                RuleKind::Instruction => {
                    let command = self.lower_command(child_rule(item, 0)?)?;
                    self.instructions.push(Instruction::Command(command));
                }
                RuleKind::Conditional => self.lower_conditional(item, false)?,
                RuleKind::NegConditional => self.lower_conditional(item, true)?,
                other => {
                    return Err(CompileError::UnexpectedRule {
                        expected: "instruction' or 'conditional".to_string(),
                        got: other.name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn lower_command(&mut self, tree: &Tree) -> Result<Command, CompileError> {
        match tree.kind {
            RuleKind::Call => {
                let target = arg_text(child_arg(tree, 0)?, ArgKind::Name)?;
                self.note_called(&target);
                Ok(Command::new(Opcode::Call, Operand::Name(target)))
            }
            RuleKind::Click | RuleKind::DoubleClick | RuleKind::Pclick => {
                let opcode = match tree.kind {
                    RuleKind::Click => Opcode::Click,
                    RuleKind::DoubleClick => Opcode::DoubleClick,
                    _ => Opcode::Pclick,
                };
                let first = child_arg(tree, 0)?;
                match first.kind {
                    ArgKind::Coords => {
                        let (x, y) = coordinates(&first.text)?;
                        // Precision only matters for image search; a
                        // precise click on literal coordinates is a
                        // plain click.
                        let opcode = if opcode == Opcode::Pclick {
                            Opcode::Click
                        } else {
                            opcode
                        };
                        Ok(Command::new(opcode, Operand::Coords(x, y)))
                    }
                    ArgKind::File => Ok(Command::new(opcode, self.image_operand(tree)?)),
                    _ => Err(CompileError::MalformedNode {
                        rule: tree.kind.name(),
                    }),
                }
            }
            RuleKind::Find => Ok(Command::new(Opcode::Find, self.image_operand(tree)?)),
            RuleKind::Pfind => Ok(Command::new(Opcode::Pfind, self.image_operand(tree)?)),
            RuleKind::Jump => {
                let target = arg_text(child_arg(tree, 0)?, ArgKind::Name)?;
                self.note_called(&target);
                Ok(Command::new(Opcode::Jump, Operand::Name(target)))
            }
            RuleKind::Label => {
                let name = arg_text(child_arg(tree, 0)?, ArgKind::Name)?;
                self.define_label(&name)?;
                Ok(Command::label(name))
            }
            RuleKind::Pause => Ok(Command::bare(Opcode::Pause)),
            RuleKind::Return => Ok(Command::bare(Opcode::Return)),
            RuleKind::Wait => {
                let time = arg_text(child_arg(tree, 0)?, ArgKind::Time)?;
                Ok(Command::new(
                    Opcode::Wait,
                    Operand::Seconds(duration_seconds(&time)?),
                ))
            }
            other => Err(CompileError::UnexpectedRule {
                expected: "an instruction".to_string(),
                got: other.name().to_string(),
            }),
        }
    }

    /// Lowers `IF cond { body } [ELSE { alt }]` into a [`Conditional`]
    /// record followed by the body, an optional `JUMP end / LABEL else /
    /// alt` sequence, and the end label.
    fn lower_conditional(&mut self, tree: &Tree, negate: bool) -> Result<(), CompileError> {
        let condition_tree = child_rule(tree, 0)?;
        let condition = self.lower_command(condition_tree)?;
        if !condition.opcode.is_find() {
            return Err(CompileError::UnexpectedRule {
                expected: "find' or 'pfind".to_string(),
                got: condition_tree.kind.name().to_string(),
            });
        }

        let end_label = self.fresh_label("end")?;
        self.note_called(&end_label);
        let conditional_index = self.instructions.len();
        self.instructions.push(Instruction::Conditional(Conditional {
            condition,
            negate,
            end_label: end_label.clone(),
            else_label: None,
        }));

        self.lower_body(child_rule(tree, 1)?)?;

        if tree.children.len() > 2 {
            self.instructions.push(Instruction::Command(Command::new(
                Opcode::Jump,
                Operand::Name(end_label.clone()),
            )));
            let else_label = self.fresh_label("else")?;
            self.note_called(&else_label);
            self.instructions
                .push(Instruction::Command(Command::label(else_label.clone())));
            if let Instruction::Conditional(conditional) =
                &mut self.instructions[conditional_index]
            {
                conditional.else_label = Some(else_label);
            }
            self.lower_body(child_rule(tree, 2)?)?;
        }

        self.instructions
            .push(Instruction::Command(Command::label(end_label)));
        Ok(())
    }

    /// Second pass: record the index of every LABEL instruction,
    /// synthetic branch labels included.
    fn label_table(&self) -> HashMap<String, usize> {
        let mut labels = HashMap::new();
        for (index, instruction) in self.instructions.iter().enumerate() {
            if let Instruction::Command(Command {
                opcode: Opcode::Label,
                operand: Operand::Name(name),
            }) = instruction
            {
                labels.insert(name.clone(), index);
            }
        }
        labels
    }

    fn define_label(&mut self, name: &str) -> Result<(), CompileError> {
        if !self.defined_labels.insert(name.to_string()) {
            return Err(CompileError::DuplicateLabel(name.to_string()));
        }
        Ok(())
    }

    /// Branch labels come from a counter under the reserved `@` prefix,
    /// which the NAME grammar cannot produce, so compiled output is
    /// reproducible and collisions with user labels are impossible.
    /// They still go through the regular uniqueness check.
    fn fresh_label(&mut self, kind: &str) -> Result<String, CompileError> {
        let name = format!("@{kind}_{}", self.next_branch);
        self.next_branch += 1;
        self.define_label(&name)?;
        Ok(name)
    }

    fn note_called(&mut self, label: &str) {
        if !self.called_labels.iter().any(|known| known == label) {
            self.called_labels.push(label.to_string());
        }
    }

    fn image_operand(&mut self, tree: &Tree) -> Result<Operand, CompileError> {
        let path = arg_text(child_arg(tree, 0)?, ArgKind::File)?;
        let time = arg_text(child_arg(tree, 1)?, ArgKind::Time)?;
        self.images.push(path.clone());
        Ok(Operand::Image {
            path,
            timeout_secs: duration_seconds(&time)?,
        })
    }
}

fn expect_kind(tree: &Tree, expected: RuleKind) -> Result<(), CompileError> {
    if tree.kind != expected {
        return Err(CompileError::UnexpectedRule {
            expected: expected.name().to_string(),
            got: tree.kind.name().to_string(),
        });
    }
    Ok(())
}

fn rule_node<'t>(node: &'t Node, parent: RuleKind) -> Result<&'t Tree, CompileError> {
    match node {
        Node::Rule(tree) => Ok(tree),
        Node::Token(_) => Err(CompileError::MalformedNode {
            rule: parent.name(),
        }),
    }
}

fn child_rule(tree: &Tree, index: usize) -> Result<&Tree, CompileError> {
    match tree.children.get(index) {
        Some(Node::Rule(child)) => Ok(child),
        _ => Err(CompileError::MalformedNode {
            rule: tree.kind.name(),
        }),
    }
}

fn child_arg(tree: &Tree, index: usize) -> Result<&Arg, CompileError> {
    match tree.children.get(index) {
        Some(Node::Token(arg)) => Ok(arg),
        _ => Err(CompileError::MalformedNode {
            rule: tree.kind.name(),
        }),
    }
}

fn arg_text(arg: &Arg, expected: ArgKind) -> Result<String, CompileError> {
    if arg.kind != expected {
        return Err(CompileError::InvalidArgument {
            what: "argument",
            text: arg.text.clone(),
        });
    }
    Ok(arg.text.clone())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{CompileError, coordinates, duration_seconds};
    use crate::compile_source;
    use crate::program::{Command, Conditional, Instruction, Opcode, Operand};

    fn compile(source: &str) -> super::CompiledProgram {
        compile_source(source).expect("compile should succeed")
    }

    fn compile_err(source: &str) -> CompileError {
        let tokens = crate::lexer::tokenize(source).expect("tokenize should succeed");
        let tree = crate::parser::parse_tokens(tokens).expect("parse should succeed");
        super::compile(&tree).expect_err("compile should fail")
    }

    #[test]
    fn converts_durations_with_unit_suffixes() {
        assert_eq!(duration_seconds("50s").unwrap(), 50);
        assert_eq!(duration_seconds("42m").unwrap(), 2520);
        assert_eq!(duration_seconds("12h").unwrap(), 43200);
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(duration_seconds("s").is_err());
        assert!(duration_seconds("10x").is_err());
        assert!(duration_seconds("").is_err());
    }

    #[test]
    fn rejects_durations_that_overflow_seconds() {
        assert_eq!(
            duration_seconds("9999999999999999999m"),
            Err(CompileError::InvalidArgument {
                what: "duration",
                text: "9999999999999999999m".to_string(),
            })
        );
        assert!(duration_seconds("9999999999999999999h").is_err());
    }

    #[test]
    fn converts_coordinate_pairs() {
        assert_eq!(coordinates("1,1").unwrap(), (1, 1));
        assert_eq!(coordinates("120, 45").unwrap(), (120, 45));
        assert!(coordinates("12").is_err());
    }

    #[test]
    fn compiles_macro_with_comments() {
        let compiled = compile(
            "# leading comment\nMACRO foobar { # trailing\n WAIT 1s\n} # done",
        );

        assert_eq!(
            compiled.program.instructions,
            vec![
                Instruction::Command(Command::label("foobar")),
                Instruction::Command(Command::new(Opcode::Wait, Operand::Seconds(1))),
                Instruction::Command(Command::bare(Opcode::End)),
            ]
        );
        assert_eq!(compiled.program.labels.len(), 1);
        assert_eq!(compiled.program.entry("foobar"), Some(0));
    }

    #[test]
    fn procedure_ends_with_return_not_end() {
        let compiled = compile("MACRO m { WAIT 1s } PROC helper { WAIT 2s }");

        assert_eq!(
            compiled.program.instructions[3..],
            [
                Instruction::Command(Command::label("helper")),
                Instruction::Command(Command::new(Opcode::Wait, Operand::Seconds(2))),
                Instruction::Command(Command::bare(Opcode::Return)),
            ]
        );
        assert_eq!(compiled.program.entry("helper"), Some(3));
    }

    #[test]
    fn lowers_conditional_without_else() {
        let compiled = compile("MACRO foobar { IF FIND image.png WITHIN 5s { WAIT 4s } }");

        assert_eq!(
            compiled.program.instructions,
            vec![
                Instruction::Command(Command::label("foobar")),
                Instruction::Conditional(Conditional {
                    condition: Command::new(
                        Opcode::Find,
                        Operand::Image {
                            path: "image.png".to_string(),
                            timeout_secs: 5,
                        },
                    ),
                    negate: false,
                    end_label: "@end_0".to_string(),
                    else_label: None,
                }),
                Instruction::Command(Command::new(Opcode::Wait, Operand::Seconds(4))),
                Instruction::Command(Command::label("@end_0")),
                Instruction::Command(Command::bare(Opcode::End)),
            ]
        );
        assert_eq!(compiled.program.entry("@end_0"), Some(3));
    }

    #[test]
    fn lowers_conditional_with_else_branch() {
        let compiled = compile(
            "MACRO foobar { IF FIND image.png WITHIN 5s { WAIT 4s } ELSE { WAIT 5s } }",
        );

        assert_eq!(
            compiled.program.instructions,
            vec![
                Instruction::Command(Command::label("foobar")),
                Instruction::Conditional(Conditional {
                    condition: Command::new(
                        Opcode::Find,
                        Operand::Image {
                            path: "image.png".to_string(),
                            timeout_secs: 5,
                        },
                    ),
                    negate: false,
                    end_label: "@end_0".to_string(),
                    else_label: Some("@else_1".to_string()),
                }),
                Instruction::Command(Command::new(Opcode::Wait, Operand::Seconds(4))),
                Instruction::Command(Command::new(
                    Opcode::Jump,
                    Operand::Name("@end_0".to_string()),
                )),
                Instruction::Command(Command::label("@else_1")),
                Instruction::Command(Command::new(Opcode::Wait, Operand::Seconds(5))),
                Instruction::Command(Command::label("@end_0")),
                Instruction::Command(Command::bare(Opcode::End)),
            ]
        );
    }

    #[test]
    fn negated_conditional_sets_the_negate_flag() {
        let compiled = compile("MACRO m { IF NOT FIND x.png WITHIN 1s { WAIT 1s } }");

        let Instruction::Conditional(conditional) = &compiled.program.instructions[1] else {
            panic!("expected a conditional record");
        };
        assert!(conditional.negate);
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let source =
            "MACRO m { IF FIND a.png WITHIN 1s { WAIT 1s } ELSE { WAIT 2s } JUMP TO m }";
        let first = compile(source);
        let second = compile(source);
        assert_eq!(first.program, second.program);
    }

    #[test]
    fn rejects_program_without_a_macro() {
        assert_eq!(
            compile_err("PROC helper { WAIT 1s }"),
            CompileError::NoMacroDefined
        );
        assert_eq!(compile_err(""), CompileError::NoMacroDefined);
    }

    #[test]
    fn rejects_duplicate_labels() {
        let error = compile_err("MACRO m { LABEL spot WAIT 1s LABEL spot }");
        assert_eq!(error.to_string(), "Label 'spot' is already in use");
    }

    #[test]
    fn rejects_duplicate_macro_names() {
        let error = compile_err("MACRO m { WAIT 1s } MACRO m { WAIT 2s }");
        assert_eq!(error, CompileError::DuplicateLabel("m".to_string()));
    }

    #[test]
    fn macro_and_procedure_names_share_one_namespace() {
        let error = compile_err("MACRO m { WAIT 1s } PROC m { WAIT 2s }");
        assert_eq!(error, CompileError::DuplicateLabel("m".to_string()));
    }

    #[test]
    fn undefined_call_target_passes_compile_but_fails_validation() {
        let compiled = compile("MACRO m { CALL missing }");
        assert_eq!(
            compiled.check_labels(),
            Err(CompileError::UndefinedLabel("missing".to_string()))
        );
    }

    #[test]
    fn forward_references_are_legal() {
        let compiled = compile("MACRO m { CALL later } PROC later { WAIT 1s }");
        compiled.check_labels().expect("labels should resolve");
    }

    #[test]
    fn missing_image_fails_validation_only() {
        let compiled = compile("MACRO m { FIND nowhere.png WITHIN 1s }");
        assert_eq!(
            compiled.check_images(Path::new("/definitely/not/here")),
            Err(CompileError::MissingImage("nowhere.png".to_string()))
        );
    }

    #[test]
    fn synthetic_labels_do_not_collide_across_conditionals() {
        let compiled = compile(
            "MACRO m { IF FIND a.png WITHIN 1s { WAIT 1s } IF FIND b.png WITHIN 1s { WAIT 1s } }",
        );

        let ends: Vec<_> = compiled
            .program
            .instructions
            .iter()
            .filter_map(|instruction| match instruction {
                Instruction::Conditional(conditional) => Some(conditional.end_label.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 2);
        assert_ne!(ends[0], ends[1]);
        for end in &ends {
            assert!(compiled.program.labels.contains_key(end));
        }
    }
}
