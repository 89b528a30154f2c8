fn main() {
    fieldquery_lib::run()
}
